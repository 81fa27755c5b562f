use std::sync::Arc;
use std::time::Duration;

use crate::ai::PaperScorer;
use crate::error::Result;
use crate::models::{Embedding, Enrichment, RawPaper};
use crate::services::Embedder;

use super::IngestStats;

/// Pairs the LLM scorer with the embedding service for the batch job.
pub struct Enricher {
    scorer: Arc<dyn PaperScorer>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    pause_every: u32,
    pause: Duration,
}

impl Enricher {
    pub fn new(
        scorer: Arc<dyn PaperScorer>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        pause_every: u32,
        pause: Duration,
    ) -> Self {
        Self {
            scorer,
            embedder,
            batch_size: batch_size.max(1),
            pause_every,
            pause,
        }
    }

    pub fn model_version(&self) -> &str {
        self.scorer.model_version()
    }

    /// Embeds every paper, one slot per input. A failed batch is retried
    /// paper by paper so only the offending texts come back as `None`.
    pub async fn embed_all(&self, papers: &[RawPaper], stats: &mut IngestStats) -> Vec<Option<Embedding>> {
        let mut embeddings = Vec::with_capacity(papers.len());

        for chunk in papers.chunks(self.batch_size) {
            let texts: Vec<String> = chunk.iter().map(RawPaper::embedding_text).collect();
            stats.embedding_calls += 1;
            match self.embedder.embed_batch(&texts).await {
                Ok(batch) if batch.len() == chunk.len() => {
                    embeddings.extend(batch.into_iter().map(Some))
                }
                outcome => {
                    let reason = match outcome {
                        Ok(batch) => format!("{} embeddings returned", batch.len()),
                        Err(e) => e.to_string(),
                    };
                    tracing::warn!(
                        "Batch embedding of {} papers failed ({}), embedding individually",
                        chunk.len(),
                        reason
                    );
                    for (paper, text) in chunk.iter().zip(&texts) {
                        stats.embedding_calls += 1;
                        match self.embedder.embed(text).await {
                            Ok(embedding) => embeddings.push(Some(embedding)),
                            Err(e) => {
                                tracing::warn!("Embedding failed for {}: {}", paper.arxiv_id, e);
                                embeddings.push(None);
                            }
                        }
                    }
                }
            }
        }

        embeddings
    }

    /// Scores one paper, sleeping first whenever the call count reaches a
    /// multiple of the pause interval.
    pub async fn score(&self, paper: &RawPaper, stats: &mut IngestStats) -> Result<Enrichment> {
        if self.pause_every > 0
            && stats.llm_calls > 0
            && stats.llm_calls % self.pause_every as usize == 0
            && !self.pause.is_zero()
        {
            tracing::debug!("Pausing {:?} after {} LLM calls", self.pause, stats.llm_calls);
            tokio::time::sleep(self.pause).await;
        }
        stats.llm_calls += 1;
        self.scorer.score(&paper.title, &paper.abstract_text).await
    }
}
