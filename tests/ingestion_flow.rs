//! End-to-end ingestion scenarios over the in-memory fabric.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{DIM, Fixture, FixtureExtractor, drain_events, harness, test_config};

use citeweave::extract::ExtractorRegistry;
use citeweave::ident;
use citeweave::model::{Entity, EntityType, LocationEntry, LocationMap, Mention, Stage};
use citeweave::providers::{EmbeddingTier, FlakyEmbedder, HashEmbedder, ProviderFactory};
use citeweave::rag::{QueryOptions, RagResolver};
use citeweave::stores::{GraphQuery, GraphRow, StoreFacade, labels};

fn registry_for(fixtures: HashMap<String, Fixture>) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::empty();
    registry.register(Arc::new(FixtureExtractor::new(fixtures)));
    registry
}

async fn count(facade: &StoreFacade, query: GraphQuery) -> u64 {
    match facade.graph.query(query).await.unwrap().first() {
        Some(GraphRow::Count(n)) => *n,
        _ => panic!("expected a count row"),
    }
}

async fn entity_node(facade: &StoreFacade, entity_id: &str) -> Option<Entity> {
    match facade.graph.node(entity_id).await.unwrap() {
        Some(GraphRow::Node { props, .. }) => Some(serde_json::from_value(props).unwrap()),
        _ => None,
    }
}

#[tokio::test]
async fn plain_article_ingests_to_completion() {
    let url = "https://fixture.test/about";
    let text = "Acme Corporation builds reliable solar inverters. \
                Dr. Grace Hopper advised the engineering team in March 2020. \
                The company is headquartered in Berlin.";
    let fixtures = HashMap::from([(url.to_string(), Fixture::text_only("About Acme", text))]);
    let factory = ProviderFactory::local_only(DIM);
    let h = harness(registry_for(fixtures), &factory, test_config()).await;

    let job_id = h.manager.submit(url, 5).await.unwrap();
    let events = drain_events(&h, job_id).await;

    // Ordered, gapless event log ending in COMPLETE at 100%.
    assert_eq!(events.first().unwrap().stage, Stage::Queued);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
    for pair in events.windows(2) {
        assert!(pair[0].percent <= pair[1].percent);
    }
    let terminal = events.last().unwrap();
    assert_eq!(terminal.stage, Stage::Complete);
    assert_eq!(terminal.percent, 100);
    assert_eq!(
        events.iter().filter(|e| e.stage.is_terminal()).count(),
        1
    );

    // The document landed under its deterministic id.
    let doc_id = ident::doc_id(url).unwrap();
    let document = h.facade.document(&doc_id).await.unwrap().unwrap();
    assert_eq!(document.title, "About Acme");
    assert_eq!(document.byte_length, text.len());

    let chunk_count = count(
        &h.facade,
        GraphQuery::CountNodes {
            label: Some(labels::CHUNK.to_string()),
        },
    )
    .await;
    assert!(chunk_count >= 1);

    // The page mentions an organization.
    let mention_rows = h
        .facade
        .graph
        .query(GraphQuery::NodesByLabel(labels::MENTION.to_string()))
        .await
        .unwrap();
    let mentions: Vec<Mention> = mention_rows
        .into_iter()
        .filter_map(|row| match row {
            GraphRow::Node { props, .. } => serde_json::from_value(props).ok(),
            _ => None,
        })
        .collect();
    assert!(mentions.iter().any(|m| matches!(
        m.entity_type,
        EntityType::Org | EntityType::Person
    )));

    let job = h.manager.status(job_id).await.unwrap().unwrap();
    assert_eq!(job.result_doc_id, Some(doc_id));
    h.manager.stop();
}

#[tokio::test]
async fn duplicate_submission_is_a_no_op_diff() {
    let url = "https://fixture.test/dup";
    let text = "Helios Energy announced a storage facility. \
                The facility is located in Norway.";
    let fixtures = HashMap::from([(url.to_string(), Fixture::text_only("Dup", text))]);
    let factory = ProviderFactory::local_only(DIM);
    let h = harness(registry_for(fixtures), &factory, test_config()).await;

    let first = h.manager.submit(url, 5).await.unwrap();
    let first_events = drain_events(&h, first).await;
    assert_eq!(first_events.last().unwrap().stage, Stage::Complete);

    let doc_id = ident::doc_id(url).unwrap();
    let ingested_at = h
        .facade
        .document(&doc_id)
        .await
        .unwrap()
        .unwrap()
        .ingested_at;
    let nodes_before = count(&h.facade, GraphQuery::CountNodes { label: None }).await;
    let edges_before = count(&h.facade, GraphQuery::CountEdges { label: None }).await;
    let vectors_before = h.facade.vector.len().await.unwrap();

    let second = h.manager.submit(url, 5).await.unwrap();
    assert_ne!(first, second);
    let second_events = drain_events(&h, second).await;
    assert_eq!(second_events.last().unwrap().stage, Stage::Complete);

    // All upserts were no-ops: identical ids, zero new rows.
    assert_eq!(
        count(&h.facade, GraphQuery::CountNodes { label: None }).await,
        nodes_before
    );
    assert_eq!(
        count(&h.facade, GraphQuery::CountEdges { label: None }).await,
        edges_before
    );
    assert_eq!(h.facade.vector.len().await.unwrap(), vectors_before);
    assert_eq!(
        h.facade
            .document(&doc_id)
            .await
            .unwrap()
            .unwrap()
            .ingested_at,
        ingested_at
    );
    h.manager.stop();
}

#[tokio::test]
async fn entity_variants_unify_across_documents() {
    let url_a = "https://fixture.test/openai-a";
    let url_b = "https://fixture.test/openai-b";
    let fixtures = HashMap::from([
        (
            url_a.to_string(),
            Fixture::text_only("A", "OpenAI announced a research milestone."),
        ),
        (
            url_b.to_string(),
            Fixture::text_only("B", "Open AI released an updated interface."),
        ),
    ]);
    let factory = ProviderFactory::local_only(DIM);
    let h = harness(registry_for(fixtures), &factory, test_config()).await;

    let job_a = h.manager.submit(url_a, 5).await.unwrap();
    assert_eq!(drain_events(&h, job_a).await.last().unwrap().stage, Stage::Complete);
    let job_b = h.manager.submit(url_b, 5).await.unwrap();
    assert_eq!(drain_events(&h, job_b).await.last().unwrap().stage, Stage::Complete);

    let canonical_id = ident::entity_id("OpenAI", EntityType::Org);
    let entity = entity_node(&h.facade, &canonical_id).await.unwrap();
    assert_eq!(entity.mention_count, 2);
    assert!(entity.aliases.contains(&"open ai".to_string()));

    // No second canonical entity for the variant spelling.
    let variant_id = ident::entity_id("Open AI", EntityType::Org);
    assert!(entity_node(&h.facade, &variant_id).await.is_none());

    let refers = count(
        &h.facade,
        GraphQuery::CountEdges {
            label: Some(labels::REFERS_TO.to_string()),
        },
    )
    .await;
    assert_eq!(refers, 2);
    h.manager.stop();
}

#[tokio::test]
async fn transient_embedding_failures_retry_to_success() {
    let url = "https://fixture.test/flaky-embed";
    let fixtures = HashMap::from([(
        url.to_string(),
        Fixture::text_only("Flaky", "Apex Systems shipped a firmware update."),
    )]);

    let mut factory = ProviderFactory::local_only(DIM);
    let flaky = Arc::new(FlakyEmbedder::failing(
        Arc::new(HashEmbedder::new(DIM)),
        2,
    ));
    factory.set_embedding_chain(EmbeddingTier::LocalSmall, vec![flaky.clone()]);

    let h = harness(registry_for(fixtures), &factory, test_config()).await;
    let job_id = h.manager.submit(url, 5).await.unwrap();
    let events = drain_events(&h, job_id).await;

    assert_eq!(events.last().unwrap().stage, Stage::Complete);
    assert_eq!(
        events.iter().filter(|e| e.stage == Stage::Complete).count(),
        1
    );

    let job = h.manager.status(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.status, citeweave::model::JobStatus::Completed);

    // No duplicate vectors despite three attempts.
    let chunk_count = count(
        &h.facade,
        GraphQuery::CountNodes {
            label: Some(labels::CHUNK.to_string()),
        },
    )
    .await;
    assert_eq!(h.facade.vector.len().await.unwrap() as u64, chunk_count);
    h.manager.stop();
}

#[tokio::test]
async fn paged_documents_cite_with_page_numbers() {
    let url = "https://fixture.test/paged";
    let page_one = "Introductory remarks about the facility and its staff.";
    let page_two = "The reactor output doubled during the spring campaign.";
    let page_three = "Closing notes and acknowledgements from the operators.";
    let text = format!("{page_one}\n\n{page_two}\n\n{page_three}");

    let mut map = LocationMap::new();
    map.push(LocationEntry {
        byte_offset: 0,
        page_number: Some(1),
        ..Default::default()
    });
    map.push(LocationEntry {
        byte_offset: page_one.len() + 2,
        page_number: Some(2),
        ..Default::default()
    });
    map.push(LocationEntry {
        byte_offset: page_one.len() + 2 + page_two.len() + 2,
        page_number: Some(3),
        ..Default::default()
    });

    let fixtures = HashMap::from([(
        url.to_string(),
        Fixture {
            title: "Paged".into(),
            text: text.clone(),
            location_map: map,
        },
    )]);

    let factory = ProviderFactory::local_only(DIM);
    let mut config = test_config();
    config.chunk_size_bytes = 60;
    config.overlap_bytes = 0;
    let h = harness(registry_for(fixtures), &factory, config.clone()).await;

    let job_id = h.manager.submit(url, 5).await.unwrap();
    assert_eq!(drain_events(&h, job_id).await.last().unwrap().stage, Stage::Complete);

    let rag = RagResolver::new(
        h.facade.clone(),
        factory.embedder(EmbeddingTier::LocalSmall),
        factory.generator(citeweave::providers::GenerativeTier::Nano),
        config,
    );
    let answer = rag
        .answer("what happened to the reactor output", &QueryOptions::default())
        .await
        .unwrap();

    let citation = answer
        .citations
        .iter()
        .find(|c| c.quote.contains("reactor output"))
        .expect("the answer cites the page-two chunk");
    assert_eq!(citation.page, Some(2));

    // Provenance roundtrip through the stored chunk.
    let chunk = h.facade.chunk(&citation.chunk_id).await.unwrap().unwrap();
    let local = (
        citation.byte_range.0 - chunk.start_offset,
        citation.byte_range.1 - chunk.start_offset,
    );
    assert_eq!(&chunk.text[local.0..local.1], citation.quote);
    assert!(citation.byte_range.1 <= text.len());
    h.manager.stop();
}

#[tokio::test]
async fn second_subscriber_can_replay_after_completion() {
    let url = "https://fixture.test/replay";
    let fixtures = HashMap::from([(
        url.to_string(),
        Fixture::text_only("Replay", "Nordic Labs published a field report."),
    )]);
    let factory = ProviderFactory::local_only(DIM);
    let h = harness(registry_for(fixtures), &factory, test_config()).await;

    let job_id = h.manager.submit(url, 5).await.unwrap();
    let live = drain_events(&h, job_id).await;

    // A late subscriber replays the identical sequence from durable storage.
    let mut replayed = Vec::new();
    let mut stream = h.manager.bus().subscribe(job_id, 0).await.unwrap();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
    {
        replayed.push(event);
    }
    let seqs: Vec<u64> = replayed.iter().map(|e| e.seq).collect();
    let live_seqs: Vec<u64> = live.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, live_seqs);
    h.manager.stop();
}
