use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{EnrichedPaper, RawPaper, UpsertOutcome};

use super::Enricher;

/// Counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: usize,
    pub new: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub skipped_embedding: usize,
    pub skipped_scoring: usize,
    pub llm_calls: usize,
    pub embedding_calls: usize,
}

impl IngestStats {
    pub fn written(&self) -> usize {
        self.new + self.updated
    }

    pub fn skipped(&self) -> usize {
        self.skipped_embedding + self.skipped_scoring
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {}, new {}, updated {}, duplicates {}, skipped {} (embedding {}, scoring {}), \
             {} LLM calls, {} embedding calls",
            self.fetched,
            self.new,
            self.updated,
            self.duplicates,
            self.skipped(),
            self.skipped_embedding,
            self.skipped_scoring,
            self.llm_calls,
            self.embedding_calls
        )
    }
}

/// Enriches fetched papers and writes them to the store.
pub struct IngestJob {
    repository: Arc<Repository>,
    enricher: Enricher,
    reenrich: bool,
}

impl IngestJob {
    pub fn new(repository: Arc<Repository>, enricher: Enricher, reenrich: bool) -> Self {
        Self {
            repository,
            enricher,
            reenrich,
        }
    }

    /// Papers that fail enrichment are skipped and stay out of the store, so
    /// a later run picks them up again. Store errors abort the run, as does a
    /// run in which every pending paper failed.
    pub async fn run(&self, papers: Vec<RawPaper>) -> Result<IngestStats> {
        let mut stats = IngestStats {
            fetched: papers.len(),
            ..Default::default()
        };

        let mut pending = Vec::with_capacity(papers.len());
        for paper in papers {
            if !self.reenrich && self.repository.exists(&paper.arxiv_id).await? {
                stats.duplicates += 1;
            } else {
                pending.push(paper);
            }
        }

        if pending.is_empty() {
            tracing::info!("Nothing new to enrich ({} already stored)", stats.duplicates);
            return Ok(stats);
        }
        tracing::info!(
            "Enriching {} papers with {}",
            pending.len(),
            self.enricher.model_version()
        );

        let embeddings = self.enricher.embed_all(&pending, &mut stats).await;
        let total = pending.len();

        for (index, (paper, embedding)) in pending.into_iter().zip(embeddings).enumerate() {
            let Some(embedding) = embedding else {
                stats.skipped_embedding += 1;
                continue;
            };

            let enrichment = match self.enricher.score(&paper, &mut stats).await {
                Ok(enrichment) => enrichment,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", paper.arxiv_id, e);
                    stats.skipped_scoring += 1;
                    continue;
                }
            };

            tracing::info!(
                "[{}/{}] {} scored {}: {}",
                index + 1,
                total,
                paper.arxiv_id,
                enrichment.score,
                paper.title
            );

            let enriched = EnrichedPaper {
                raw: paper,
                enrichment,
                embedding,
            };
            match self.repository.upsert_paper(&enriched).await? {
                UpsertOutcome::Inserted => stats.new += 1,
                UpsertOutcome::Updated => stats.updated += 1,
            }
        }

        tracing::info!("Ingest finished: {}", stats);

        if stats.written() == 0 {
            return Err(anyhow!("all {} pending papers failed enrichment", total).into());
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::PaperScorer;
    use crate::db::test_support::{axis_embedding, enriched, temp_repository};
    use crate::error::AppError;
    use crate::models::{Embedding, Enrichment, ImpactScore, Tag};
    use crate::services::Embedder;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Scores every paper 8 unless its title is in `malformed`.
    #[derive(Default)]
    struct FakeScorer {
        malformed: HashSet<String>,
    }

    #[async_trait]
    impl PaperScorer for FakeScorer {
        async fn score(&self, title: &str, _abstract_text: &str) -> crate::error::Result<Enrichment> {
            if self.malformed.contains(title) {
                return Err(AppError::MalformedLlm("score out of range".to_string()));
            }
            Ok(Enrichment {
                score: ImpactScore::new(8).unwrap(),
                summary: format!("{} summarised.", title),
                tags: vec![Tag::Llm],
            })
        }

        fn model_version(&self) -> &str {
            "fake-scorer"
        }
    }

    /// Batch calls fail unless `batch_works`; single calls fail for texts
    /// starting with an entry of `broken`.
    #[derive(Default)]
    struct FlakyEmbedder {
        batch_works: bool,
        broken: HashSet<String>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> crate::error::Result<Embedding> {
            if self.broken.iter().any(|b| text.starts_with(b.as_str())) {
                return Err(AppError::EmbeddingApi("HTTP 500".to_string()));
            }
            Ok(axis_embedding(3, 0.0))
        }

        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Embedding>> {
            if !self.batch_works {
                return Err(AppError::EmbeddingApi("HTTP 503".to_string()));
            }
            Ok(texts.iter().map(|_| axis_embedding(4, 0.0)).collect())
        }
    }

    fn raw(id: &str, title: &str) -> RawPaper {
        enriched(id, 5, title).raw
    }

    fn job(repo: &Arc<Repository>, scorer: FakeScorer, embedder: FlakyEmbedder, reenrich: bool) -> IngestJob {
        let enricher = Enricher::new(Arc::new(scorer), Arc::new(embedder), 2, 10, Duration::ZERO);
        IngestJob::new(Arc::clone(repo), enricher, reenrich)
    }

    #[tokio::test]
    async fn new_papers_are_scored_embedded_and_stored() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let embedder = FlakyEmbedder {
            batch_works: true,
            ..Default::default()
        };
        let papers = vec![raw("2610.1", "One"), raw("2610.2", "Two"), raw("2610.3", "Three")];

        let stats = tokio_test::assert_ok!(job(&repo, FakeScorer::default(), embedder, false).run(papers).await);
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.new, 3);
        assert_eq!(stats.llm_calls, 3);
        // batches of two
        assert_eq!(stats.embedding_calls, 2);

        let stored = repo.get_paper("2610.2").await.unwrap().unwrap();
        assert_eq!(stored.impact_score.get(), 8);
        assert_eq!(stored.summary, "Two summarised.");
        assert_eq!(stored.embedding, axis_embedding(4, 0.0));
    }

    #[tokio::test]
    async fn stored_identifiers_are_skipped_unless_reenriching() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        repo.upsert_paper(&enriched("2610.1", 3, "One")).await.unwrap();
        repo.mark_posted("2610.1", 5, "m").await.unwrap();
        let papers = || vec![raw("2610.1", "One"), raw("2610.2", "Two")];

        let stats = job(&repo, FakeScorer::default(), FlakyEmbedder::default(), false)
            .run(papers())
            .await
            .unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.new, 1);
        assert_eq!(repo.get_paper("2610.1").await.unwrap().unwrap().impact_score.get(), 3);

        let stats = job(&repo, FakeScorer::default(), FlakyEmbedder::default(), true)
            .run(papers())
            .await
            .unwrap();
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.updated, 2);
        let rescored = repo.get_paper("2610.1").await.unwrap().unwrap();
        assert_eq!(rescored.impact_score.get(), 8);
        assert!(rescored.posted);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_embeddings() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let embedder = FlakyEmbedder {
            batch_works: false,
            broken: ["Broken".to_string()].into_iter().collect(),
        };
        let papers = vec![raw("2610.1", "Fine"), raw("2610.2", "Broken"), raw("2610.3", "Also Fine")];

        let stats = job(&repo, FakeScorer::default(), embedder, false).run(papers).await.unwrap();
        assert_eq!(stats.new, 2);
        assert_eq!(stats.skipped_embedding, 1);
        // two failed batches plus three single calls
        assert_eq!(stats.embedding_calls, 5);
        assert_eq!(stats.llm_calls, 2);
        assert!(!repo.exists("2610.2").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_scores_defer_the_paper() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let scorer = FakeScorer {
            malformed: ["Bad".to_string()].into_iter().collect(),
        };
        let papers = vec![raw("2610.1", "Good"), raw("2610.2", "Bad")];

        let stats = job(&repo, scorer, FlakyEmbedder::default(), false).run(papers).await.unwrap();
        assert_eq!(stats.new, 1);
        assert_eq!(stats.skipped_scoring, 1);
        assert!(!repo.exists("2610.2").await.unwrap());
    }

    #[tokio::test]
    async fn run_fails_when_nothing_could_be_enriched() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let embedder = FlakyEmbedder {
            batch_works: false,
            broken: ["Only".to_string()].into_iter().collect(),
        };

        let result = job(&repo, FakeScorer::default(), embedder, false)
            .run(vec![raw("2610.1", "Only")])
            .await;
        assert!(matches!(result, Err(AppError::Other(_))));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_input_is_not_an_error() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let stats = job(&repo, FakeScorer::default(), FlakyEmbedder::default(), false)
            .run(Vec::new())
            .await
            .unwrap();
        assert_eq!(stats, IngestStats::default());
    }
}
