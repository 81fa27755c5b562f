use std::sync::Arc;

use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{FeedStats, ImpactScore, Paper, SearchHit};
use crate::services::Embedder;

pub const DEFAULT_LIMIT: usize = 5;
pub const MAX_LIMIT: usize = 10;

/// Clamps a user supplied result count to `1..=MAX_LIMIT`.
pub fn clamp_limit(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_LIMIT,
        Some(n) => n.clamp(1, MAX_LIMIT as i64) as usize,
    }
}

/// Read side of the bot: search, latest and stats.
pub struct QueryHandler {
    repository: Arc<Repository>,
    embedder: Arc<dyn Embedder>,
    similarity_floor: f32,
    threshold: ImpactScore,
}

impl QueryHandler {
    pub fn new(
        repository: Arc<Repository>,
        embedder: Arc<dyn Embedder>,
        similarity_floor: f32,
        threshold: ImpactScore,
    ) -> Self {
        Self {
            repository,
            embedder,
            similarity_floor,
            threshold,
        }
    }

    pub fn threshold(&self) -> ImpactScore {
        self.threshold
    }

    /// Semantic search, falling back to keyword search when nothing clears
    /// the similarity floor.
    pub async fn search(&self, query: &str, limit: Option<i64>) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput("search query is empty".to_string()));
        }
        let limit = clamp_limit(limit);

        let embedding = self.embedder.embed(query).await?;

        let hits = self
            .repository
            .match_papers(&embedding, self.similarity_floor, limit)
            .await?;
        if !hits.is_empty() {
            tracing::debug!("Search {:?}: {} semantic hits", query, hits.len());
            return Ok(hits);
        }

        let hits = self.repository.search_fulltext(query, limit).await?;
        tracing::debug!("Search {:?}: no semantic hits, {} keyword hits", query, hits.len());
        Ok(hits)
    }

    pub async fn latest(&self, limit: Option<i64>) -> Result<Vec<Paper>> {
        self.repository.latest(clamp_limit(limit)).await
    }

    pub async fn stats(&self) -> Result<FeedStats> {
        self.repository.stats(self.threshold).await
    }
}
