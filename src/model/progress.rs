//! Progress events: the append-only, per-job advancement log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Pipeline stage a progress event reports on.
///
/// `Complete`, `Error`, and `Cancelled` are terminal: the bus closes the
/// stream after delivering one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Queued,
    Extract,
    Chunk,
    Coref,
    Ner,
    Link,
    Relate,
    Embed,
    Index,
    Complete,
    Error,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "QUEUED",
            Stage::Extract => "EXTRACT",
            Stage::Chunk => "CHUNK",
            Stage::Coref => "COREF",
            Stage::Ner => "NER",
            Stage::Link => "LINK",
            Stage::Relate => "RELATE",
            Stage::Embed => "EMBED",
            Stage::Index => "INDEX",
            Stage::Complete => "COMPLETE",
            Stage::Error => "ERROR",
            Stage::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error | Stage::Cancelled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => Stage::Queued,
            "EXTRACT" => Stage::Extract,
            "CHUNK" => Stage::Chunk,
            "COREF" => Stage::Coref,
            "NER" => Stage::Ner,
            "LINK" => Stage::Link,
            "RELATE" => Stage::Relate,
            "EMBED" => Stage::Embed,
            "INDEX" => Stage::Index,
            "COMPLETE" => Stage::Complete,
            "ERROR" => Stage::Error,
            "CANCELLED" => Stage::Cancelled,
            _ => return None,
        })
    }

    /// Percent of the pipeline completed once this stage has finished.
    pub fn completion_percent(&self) -> u8 {
        match self {
            Stage::Queued => 0,
            Stage::Extract => 15,
            Stage::Chunk => 25,
            Stage::Coref => 35,
            Stage::Ner => 50,
            Stage::Link => 65,
            Stage::Relate => 75,
            Stage::Embed => 85,
            Stage::Index => 95,
            Stage::Complete => 100,
            // Terminal failure events freeze percent at the last completed
            // stage; the bus enforces monotonicity.
            Stage::Error | Stage::Cancelled => 0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered, immutable record of a job's advancement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    /// Strictly increasing per job, starting at 0.
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
    pub stage: Stage,
    /// 0–100, monotone non-decreasing across a job's events.
    pub percent: u8,
    pub message: String,
    /// Optional stage counters, e.g. `{"entities_found": 12}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<Value>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}#{}] {} {}% {}",
            self.job_id, self.seq, self.stage, self.percent, self.message
        )
    }
}
