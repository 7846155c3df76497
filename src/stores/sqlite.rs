/*!
SQLite relational backend

Durable implementation of [`RelationalStore`] over `sqlx`. Holds the `jobs`
work queue records, the append-only `progress_events` log, and
`documents_meta`.

## Behavior

- The schema is bootstrapped on connect with idempotent `CREATE TABLE IF NOT
  EXISTS` statements; no external migration orchestration is required.
- Timestamps are stored as RFC 3339 text; enums as their canonical string
  forms.
- `progress_events` inserts use `INSERT OR IGNORE` on `(job_id, seq)` so
  replayed emissions are no-ops, matching the bus's at-least-once contract.

## Database schema

- `jobs(job_id PK, url, priority, status, attempt_count, max_attempts,
  created_at, updated_at, last_error, result_doc_id)`
- `progress_events(job_id, seq, emitted_at, stage, percent, message,
  counters, PRIMARY KEY (job_id, seq))`
- `documents_meta(doc_id PK, url, title, source_kind, ingested_at, tier,
  quality_score, byte_length)`
*/

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::model::{
    Document, Job, JobStatus, ProgressEvent, SourceKind, Stage, Tier,
};

use super::{RelationalStore, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id        TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    priority      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    max_attempts  INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    last_error    TEXT,
    result_doc_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

CREATE TABLE IF NOT EXISTS progress_events (
    job_id     TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    emitted_at TEXT NOT NULL,
    stage      TEXT NOT NULL,
    percent    INTEGER NOT NULL,
    message    TEXT NOT NULL,
    counters   TEXT,
    PRIMARY KEY (job_id, seq)
);

CREATE TABLE IF NOT EXISTS documents_meta (
    doc_id        TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    title         TEXT NOT NULL,
    source_kind   TEXT NOT NULL,
    ingested_at   TEXT NOT NULL,
    tier          TEXT NOT NULL,
    quality_score REAL NOT NULL,
    byte_length   INTEGER NOT NULL
);
";

/// `sqlx`-backed [`RelationalStore`].
pub struct SqliteRelationalStore {
    pool: SqlitePool,
}

impl SqliteRelationalStore {
    /// Connect and bootstrap the schema. `url` accepts the usual sqlx forms
    /// (`sqlite::memory:`, `sqlite://path/to.db`); file databases are created
    /// when missing.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx_error)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(sqlx_error)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(())
    }
}

fn sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::not_found("row"),
        other => StoreError::Backend {
            message: other.to_string(),
        },
    }
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::backend(format!("bad timestamp {raw:?}: {err}")))
}

fn job_from_row(row: &SqliteRow) -> StoreResult<Job> {
    let job_id: String = row.try_get("job_id").map_err(sqlx_error)?;
    let status: String = row.try_get("status").map_err(sqlx_error)?;
    let created_at: String = row.try_get("created_at").map_err(sqlx_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(sqlx_error)?;
    Ok(Job {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|err| StoreError::backend(format!("bad job id {job_id:?}: {err}")))?,
        url: row.try_get("url").map_err(sqlx_error)?,
        priority: row.try_get::<i64, _>("priority").map_err(sqlx_error)? as u8,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::backend(format!("unknown job status {status:?}")))?,
        attempt_count: row.try_get::<i64, _>("attempt_count").map_err(sqlx_error)? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(sqlx_error)? as u32,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        last_error: row.try_get("last_error").map_err(sqlx_error)?,
        result_doc_id: row.try_get("result_doc_id").map_err(sqlx_error)?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<ProgressEvent> {
    let job_id: String = row.try_get("job_id").map_err(sqlx_error)?;
    let stage: String = row.try_get("stage").map_err(sqlx_error)?;
    let emitted_at: String = row.try_get("emitted_at").map_err(sqlx_error)?;
    let counters: Option<String> = row.try_get("counters").map_err(sqlx_error)?;
    Ok(ProgressEvent {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|err| StoreError::backend(format!("bad job id {job_id:?}: {err}")))?,
        seq: row.try_get::<i64, _>("seq").map_err(sqlx_error)? as u64,
        emitted_at: parse_timestamp(&emitted_at)?,
        stage: Stage::parse(&stage)
            .ok_or_else(|| StoreError::backend(format!("unknown stage {stage:?}")))?,
        percent: row.try_get::<i64, _>("percent").map_err(sqlx_error)? as u8,
        message: row.try_get("message").map_err(sqlx_error)?,
        counters: counters
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
    })
}

fn document_from_row(row: &SqliteRow) -> StoreResult<Document> {
    let source_kind: String = row.try_get("source_kind").map_err(sqlx_error)?;
    let tier: String = row.try_get("tier").map_err(sqlx_error)?;
    let ingested_at: String = row.try_get("ingested_at").map_err(sqlx_error)?;
    Ok(Document {
        doc_id: row.try_get("doc_id").map_err(sqlx_error)?,
        url: row.try_get("url").map_err(sqlx_error)?,
        title: row.try_get("title").map_err(sqlx_error)?,
        source_kind: SourceKind::parse(&source_kind)
            .ok_or_else(|| StoreError::backend(format!("unknown source kind {source_kind:?}")))?,
        ingested_at: parse_timestamp(&ingested_at)?,
        tier: Tier::parse(&tier)
            .ok_or_else(|| StoreError::backend(format!("unknown tier {tier:?}")))?,
        quality_score: row.try_get::<f64, _>("quality_score").map_err(sqlx_error)? as f32,
        byte_length: row.try_get::<i64, _>("byte_length").map_err(sqlx_error)? as usize,
    })
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn upsert_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, url, priority, status, attempt_count, max_attempts, \
             created_at, updated_at, last_error, result_doc_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(job_id) DO UPDATE SET \
               url = excluded.url, priority = excluded.priority, status = excluded.status, \
               attempt_count = excluded.attempt_count, max_attempts = excluded.max_attempts, \
               updated_at = excluded.updated_at, last_error = excluded.last_error, \
               result_doc_id = excluded.result_doc_id",
        )
        .bind(job.job_id.to_string())
        .bind(&job.url)
        .bind(job.priority as i64)
        .bind(job.status.as_str())
        .bind(job.attempt_count as i64)
        .bind(job.max_attempts as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.last_error.as_deref())
        .bind(job.result_doc_id.as_deref())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn running_jobs(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('EXTRACTING', 'TRANSFORMING', 'LOADING')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED') \
             AND updated_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn append_progress(&self, event: &ProgressEvent) -> StoreResult<()> {
        let counters = event
            .counters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT OR IGNORE INTO progress_events \
             (job_id, seq, emitted_at, stage, percent, message, counters) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(event.job_id.to_string())
        .bind(event.seq as i64)
        .bind(event.emitted_at.to_rfc3339())
        .bind(event.stage.as_str())
        .bind(event.percent as i64)
        .bind(&event.message)
        .bind(counters)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    async fn progress_since(&self, job_id: Uuid, from_seq: u64) -> StoreResult<Vec<ProgressEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM progress_events WHERE job_id = ?1 AND seq >= ?2 ORDER BY seq",
        )
        .bind(job_id.to_string())
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM progress_events WHERE emitted_at < ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn upsert_document(&self, document: &Document) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO documents_meta \
             (doc_id, url, title, source_kind, ingested_at, tier, quality_score, byte_length) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(doc_id) DO UPDATE SET \
               url = excluded.url, title = excluded.title, \
               source_kind = excluded.source_kind, tier = excluded.tier, \
               quality_score = excluded.quality_score, byte_length = excluded.byte_length",
        )
        .bind(&document.doc_id)
        .bind(&document.url)
        .bind(&document.title)
        .bind(document.source_kind.as_str())
        .bind(document.ingested_at.to_rfc3339())
        .bind(document.tier.as_str())
        .bind(document.quality_score as f64)
        .bind(document.byte_length as i64)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    async fn document(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents_meta WHERE doc_id = ?1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error)?;
        row.as_ref().map(document_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;

    async fn store() -> SqliteRelationalStore {
        SqliteRelationalStore::connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn jobs_round_trip_and_upsert() {
        let store = store().await;
        let mut job = Job::new("https://example.com/a", 5, 3);
        store.upsert_job(&job).await.unwrap();

        job.transition(JobStatus::Extracting);
        job.attempt_count = 1;
        store.upsert_job(&job).await.unwrap();

        let loaded = store.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Extracting);
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.url, "https://example.com/a");

        let running = store.running_jobs().await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn progress_appends_are_idempotent_and_ordered() {
        let store = store().await;
        let job_id = Uuid::new_v4();
        for seq in [1u64, 0, 2] {
            let event = ProgressEvent {
                job_id,
                seq,
                emitted_at: Utc::now(),
                stage: Stage::Extract,
                percent: 10,
                message: format!("seq {seq}"),
                counters: Some(serde_json::json!({"n": seq})),
            };
            store.append_progress(&event).await.unwrap();
            // Replay must be a no-op.
            store.append_progress(&event).await.unwrap();
        }

        let log = store.progress_since(job_id, 0).await.unwrap();
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(log[2].counters, Some(serde_json::json!({"n": 2})));

        let tail = store.progress_since(job_id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());

        let job = {
            let store = SqliteRelationalStore::connect(&url).await.unwrap();
            let job = Job::new("https://example.com/durable", 2, 3);
            store.upsert_job(&job).await.unwrap();
            job
        };

        let reopened = SqliteRelationalStore::connect(&url).await.unwrap();
        let loaded = reopened.job(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.url, "https://example.com/durable");
        assert_eq!(loaded.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn document_upsert_preserves_row_identity() {
        let store = store().await;
        let doc = Document {
            doc_id: "d1".into(),
            url: "https://example.com".into(),
            title: "Example".into(),
            source_kind: SourceKind::Web,
            ingested_at: Utc::now(),
            tier: Tier::B,
            quality_score: 6.5,
            byte_length: 1234,
        };
        store.upsert_document(&doc).await.unwrap();
        store.upsert_document(&doc).await.unwrap();
        let loaded = store.document("d1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Example");
        assert_eq!(loaded.byte_length, 1234);
    }
}
