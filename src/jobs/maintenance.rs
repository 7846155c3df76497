//! Scheduled maintenance sweeps.
//!
//! None of these run during ingestion; they are invoked as separate jobs on
//! an operator-chosen cadence. All three are safe to repeat.

use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::Entity;
use crate::stores::{GraphQuery, GraphRow, StoreFacade, labels};

/// Counters returned by one maintenance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub entities_removed: u64,
    pub progress_events_pruned: u64,
    pub jobs_expired: u64,
}

/// Remove canonical entities nobody mentions any more.
///
/// Mentions reference entities weakly; deleting mentions decrements
/// `mention_count`, and entities that reach zero are collected here.
pub async fn sweep_orphan_entities(facade: &StoreFacade) -> Result<u64, EngineError> {
    let rows = facade
        .graph
        .query(GraphQuery::NodesByLabel(labels::ENTITY.to_string()))
        .await?;
    let mut removed = 0u64;
    for row in rows {
        let GraphRow::Node { id, props, .. } = row else {
            continue;
        };
        let entity: Entity = match serde_json::from_value(props) {
            Ok(entity) => entity,
            Err(_) => continue,
        };
        if entity.mention_count == 0 {
            facade.graph.delete_node(&id).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Prune progress events and expire terminal jobs past the retention window.
pub async fn prune_expired(
    facade: &StoreFacade,
    config: &EngineConfig,
) -> Result<SweepReport, EngineError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
    let progress_events_pruned = facade.relational.prune_progress_before(cutoff).await?;
    let jobs_expired = facade.relational.delete_jobs_before(cutoff).await?;
    Ok(SweepReport {
        entities_removed: 0,
        progress_events_pruned,
        jobs_expired,
    })
}

/// Run every sweep once.
pub async fn run_all(
    facade: &StoreFacade,
    config: &EngineConfig,
) -> Result<SweepReport, EngineError> {
    let mut report = prune_expired(facade, config).await?;
    report.entities_removed = sweep_orphan_entities(facade).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use serde_json::json;

    fn entity(id: &str, mention_count: u64) -> serde_json::Value {
        serde_json::to_value(Entity {
            entity_id: id.into(),
            canonical_name: id.into(),
            entity_type: EntityType::Org,
            aliases: Vec::new(),
            mention_count,
            context_embedding: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn only_unmentioned_entities_are_collected() {
        let facade = StoreFacade::in_memory(8);
        let mut tx = facade.graph.begin().await.unwrap();
        tx.upsert_node(labels::ENTITY, "alive", entity("alive", 3));
        tx.upsert_node(labels::ENTITY, "dead", entity("dead", 0));
        tx.upsert_edge("r1", "alive", "FOUNDED", "dead", json!({}));
        tx.commit().await.unwrap();

        let removed = sweep_orphan_entities(&facade).await.unwrap();
        assert_eq!(removed, 1);
        assert!(facade.graph.node("dead").await.unwrap().is_none());
        assert!(facade.graph.node("alive").await.unwrap().is_some());

        // Edges incident to the collected entity go with it.
        let GraphRow::Count(edges) = facade
            .graph
            .query(GraphQuery::CountEdges { label: None })
            .await
            .unwrap()[0]
            .clone()
        else {
            panic!("expected count");
        };
        assert_eq!(edges, 0);
    }

    #[tokio::test]
    async fn retention_pruning_reports_counts() {
        let facade = StoreFacade::in_memory(8);
        let config = EngineConfig {
            job_retention: std::time::Duration::from_secs(0),
            ..EngineConfig::default()
        };

        let mut job = crate::model::Job::new("https://example.com", 5, 3);
        job.transition(crate::model::JobStatus::Completed);
        facade.relational.upsert_job(&job).await.unwrap();
        facade
            .relational
            .append_progress(&crate::model::ProgressEvent {
                job_id: job.job_id,
                seq: 0,
                emitted_at: Utc::now() - chrono::Duration::seconds(5),
                stage: crate::model::Stage::Queued,
                percent: 0,
                message: "queued".into(),
                counters: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let report = prune_expired(&facade, &config).await.unwrap();
        assert_eq!(report.progress_events_pruned, 1);
        assert_eq!(report.jobs_expired, 1);
    }
}
