//! Job records owned by the job manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states for an ingestion job.
///
/// ```text
/// QUEUED → EXTRACTING → TRANSFORMING → LOADING → COMPLETED
///   │           ├─ any stage → FAILED → RETRYING → QUEUED
///   └──────── CANCELLED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Extracting,
    Transforming,
    Loading,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Transforming => "TRANSFORMING",
            JobStatus::Loading => "LOADING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Retrying => "RETRYING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States in which a worker is actively holding the job.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::Extracting | JobStatus::Transforming | JobStatus::Loading
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => JobStatus::Queued,
            "EXTRACTING" => JobStatus::Extracting,
            "TRANSFORMING" => JobStatus::Transforming,
            "LOADING" => JobStatus::Loading,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            "RETRYING" => JobStatus::Retrying,
            _ => return None,
        })
    }
}

/// One end-to-end unit of ingestion work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    /// Raw URL as submitted; normalization happens at extraction.
    pub url: String,
    /// 1 = highest priority, 10 = lowest.
    pub priority: u8,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_doc_id: Option<String>,
}

impl Job {
    pub fn new(url: impl Into<String>, priority: u8, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            url: url.into(),
            priority: priority.clamp(1, 10),
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            last_error: None,
            result_doc_id: None,
        }
    }

    /// Transition to a new status, stamping `updated_at`.
    pub fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
