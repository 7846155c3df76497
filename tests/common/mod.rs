//! Shared fixtures for the integration suites: a canned-content extractor
//! and a fully wired in-memory engine.
//!
//! Each test binary uses a subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use citeweave::config::EngineConfig;
use citeweave::error::EngineError;
use citeweave::extract::{Extraction, ExtractorRegistry, SourceExtractor, SourceMetadata};
use citeweave::jobs::JobManager;
use citeweave::model::{LocationEntry, LocationMap, ProgressEvent, SourceKind};
use citeweave::pipeline::IngestPipeline;
use citeweave::providers::{EmbeddingTier, GenerativeTier, ProviderFactory};
use citeweave::stores::StoreFacade;

pub const DIM: usize = 64;

/// Canned content served for `https://fixture.test/...` URLs.
#[derive(Clone)]
pub struct Fixture {
    pub title: String,
    pub text: String,
    pub location_map: LocationMap,
}

impl Fixture {
    pub fn text_only(title: &str, text: &str) -> Self {
        let mut location_map = LocationMap::new();
        location_map.push(LocationEntry::default());
        Self {
            title: title.to_string(),
            text: text.to_string(),
            location_map,
        }
    }
}

pub struct FixtureExtractor {
    fixtures: HashMap<String, Fixture>,
}

impl FixtureExtractor {
    pub fn new(fixtures: HashMap<String, Fixture>) -> Self {
        Self { fixtures }
    }
}

#[async_trait]
impl SourceExtractor for FixtureExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str() == Some("fixture.test")
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, EngineError> {
        let fixture = self
            .fixtures
            .get(url.as_str())
            .ok_or_else(|| EngineError::validation(format!("no fixture for {url}")))?;
        Ok(Extraction {
            raw: fixture.text.clone().into_bytes(),
            text: fixture.text.clone(),
            location_map: fixture.location_map.clone(),
            metadata: SourceMetadata {
                title: fixture.title.clone(),
                ..Default::default()
            },
        })
    }
}

/// An extractor that always fails with a transient error, counting attempts.
pub struct FlakyNetworkExtractor {
    pub calls: AtomicU32,
}

impl FlakyNetworkExtractor {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SourceExtractor for FlakyNetworkExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str() == Some("flaky.test")
    }

    async fn extract(&self, _url: &Url) -> Result<Extraction, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::transient("connection reset by fixture"))
    }
}

/// Fast-retry configuration for the integration suites.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        backoff_unit: Duration::from_millis(5),
        heartbeat_interval: Duration::from_secs(30),
        worker_concurrency: 2,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub facade: StoreFacade,
    pub manager: Arc<JobManager>,
}

/// Wire a full in-memory engine around the given registry.
pub async fn harness(
    registry: ExtractorRegistry,
    factory: &ProviderFactory,
    config: EngineConfig,
) -> Harness {
    citeweave::telemetry::init();
    let facade = StoreFacade::in_memory(DIM);
    let manager = JobManager::new(
        facade.clone(),
        IngestPipeline::standard(registry),
        factory.embedder(EmbeddingTier::LocalSmall),
        factory.generator(GenerativeTier::Nano),
        config,
    );
    manager.start().await.expect("manager starts");
    Harness { facade, manager }
}

/// Wire a harness with a custom stage chain.
pub async fn harness_with_pipeline(
    pipeline: IngestPipeline,
    factory: &ProviderFactory,
    config: EngineConfig,
) -> Harness {
    citeweave::telemetry::init();
    let facade = StoreFacade::in_memory(DIM);
    let manager = JobManager::new(
        facade.clone(),
        pipeline,
        factory.embedder(EmbeddingTier::LocalSmall),
        factory.generator(GenerativeTier::Nano),
        config,
    );
    manager.start().await.expect("manager starts");
    Harness { facade, manager }
}

/// Collect a job's full event stream (bounded by a timeout).
pub async fn drain_events(harness: &Harness, job_id: Uuid) -> Vec<ProgressEvent> {
    let mut stream = harness
        .manager
        .bus()
        .subscribe(job_id, 0)
        .await
        .expect("subscribe");
    let mut events = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = stream.next().await {
            events.push(event);
        }
    });
    deadline.await.expect("job reached a terminal event in time");
    events
}
