//! Chunk embedding.
//!
//! Chunks that already carry a vector of the configured dimensionality are
//! skipped, so replays never recompute or rewrite them. Provider calls are
//! batched and issued with a bounded fan-out; any provider error fails the
//! stage as a whole; nothing is written to the vector store here, so a
//! retry starts clean.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;

use crate::error::EngineError;
use crate::model::Stage;

use super::{IngestWork, PipelineStage, StageContext};

/// Concurrent provider calls in flight per job.
const EMBED_FANOUT: usize = 4;

pub struct EmbedStage;

#[async_trait]
impl PipelineStage for EmbedStage {
    fn stage(&self) -> Stage {
        Stage::Embed
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let dim = cx.embedder.dim();
        let pending: Vec<usize> = work
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| {
                chunk
                    .embedding
                    .as_ref()
                    .is_none_or(|vector| vector.len() != dim)
            })
            .map(|(idx, _)| idx)
            .collect();

        cx.check_cancelled()?;
        let batches: Vec<Vec<usize>> = pending
            .chunks(cx.config.embed_batch_size.max(1))
            .map(|batch| batch.to_vec())
            .collect();

        let embedder = &cx.embedder;
        let chunks = &work.chunks;
        let results: Vec<(Vec<usize>, Vec<Vec<f32>>)> = stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> =
                    batch.iter().map(|&idx| chunks[idx].text.clone()).collect();
                let vectors = embedder.embed(&texts).await?;
                if vectors.len() != batch.len() {
                    return Err(EngineError::integrity(format!(
                        "embedding provider returned {} vectors for {} chunks",
                        vectors.len(),
                        batch.len()
                    )));
                }
                Ok::<_, EngineError>((batch, vectors))
            })
            .buffered(EMBED_FANOUT)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let mut embedded = 0usize;
        for (batch, vectors) in results {
            for (idx, vector) in batch.into_iter().zip(vectors) {
                work.chunks[idx].embedding = Some(vector);
                embedded += 1;
            }
        }

        Ok(Some(serde_json::json!({
            "chunks_embedded": embedded,
            "chunks_skipped": work.chunks.len() - embedded,
            "dim": dim,
        })))
    }
}
