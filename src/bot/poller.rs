use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::db::Repository;
use crate::discord::ChatSink;
use crate::error::Result;
use crate::models::ImpactScore;

use super::render::paper_card;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Posts unposted papers at or above the score threshold, once each.
pub struct FeedPoller {
    repository: Arc<Repository>,
    sink: Arc<dyn ChatSink>,
    channel_id: u64,
    threshold: ImpactScore,
    batch_limit: usize,
}

impl FeedPoller {
    pub fn new(
        repository: Arc<Repository>,
        sink: Arc<dyn ChatSink>,
        channel_id: u64,
        threshold: ImpactScore,
        batch_limit: usize,
    ) -> Self {
        Self {
            repository,
            sink,
            channel_id,
            threshold,
            batch_limit,
        }
    }

    /// One feed tick. A paper whose send fails stays unposted and is picked
    /// up again by the next tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let candidates = self
            .repository
            .unposted_above(self.threshold, self.batch_limit)
            .await?;

        let mut report = TickReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for paper in candidates {
            let card = paper_card(&paper);
            match self.sink.send_embed(self.channel_id, &card).await {
                Ok(message_id) => {
                    if self
                        .repository
                        .mark_posted(&paper.arxiv_id, self.channel_id, &message_id)
                        .await?
                    {
                        report.sent += 1;
                        tracing::info!(
                            "Posted {} (score {}) as message {}",
                            paper.arxiv_id,
                            paper.impact_score,
                            message_id
                        );
                    } else {
                        tracing::warn!("{} was already marked posted", paper.arxiv_id);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Failed to post {}: {}", paper.arxiv_id, e);
                }
            }
        }

        Ok(report)
    }

    /// Ticks forever at `interval`, starting immediately.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.candidates > 0 => tracing::info!(
                    "Feed tick: {} candidates, {} sent, {} failed",
                    report.candidates,
                    report.sent,
                    report.failed
                ),
                Ok(_) => tracing::debug!("Feed tick: nothing to post"),
                Err(e) => tracing::error!("Feed tick failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{enriched, temp_repository};
    use crate::discord::Embed;
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every card it is handed; titles in `fail_titles` error out.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(u64, Embed)>>,
        fail_titles: Mutex<HashSet<String>>,
    }

    impl RecordingSink {
        fn titles(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, e)| e.title.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send_embed(&self, channel_id: u64, embed: &Embed) -> Result<String> {
            let title = embed.title.clone().unwrap_or_default();
            if self.fail_titles.lock().unwrap().contains(&title) {
                return Err(AppError::DiscordApi("503 Service Unavailable".to_string()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((channel_id, embed.clone()));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    fn poller(repo: &Arc<Repository>, sink: &Arc<RecordingSink>, threshold: i64) -> FeedPoller {
        FeedPoller::new(
            Arc::clone(repo),
            sink.clone(),
            99,
            ImpactScore::new(threshold).unwrap(),
            10,
        )
    }

    #[tokio::test]
    async fn high_score_paper_is_posted_exactly_once() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        repo.upsert_paper(&enriched("2610.10001", 9, "Big Result")).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let poller = poller(&repo, &sink, 7);

        let first = poller.tick().await.unwrap();
        assert_eq!(first, TickReport { candidates: 1, sent: 1, failed: 0 });
        assert!(repo.get_paper("2610.10001").await.unwrap().unwrap().posted);

        let second = poller.tick().await.unwrap();
        assert_eq!(second, TickReport::default());
        assert_eq!(sink.titles(), vec!["Big Result"]);
        assert_eq!(sink.sent.lock().unwrap()[0].0, 99);

        let record = repo.post_record("2610.10001").await.unwrap().unwrap();
        assert_eq!(record.message_id, "msg-1");
    }

    #[tokio::test]
    async fn low_score_paper_waits_for_a_lower_threshold() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        repo.upsert_paper(&enriched("2610.10002", 4, "Small Step")).await.unwrap();
        let sink = Arc::new(RecordingSink::default());

        let strict = poller(&repo, &sink, 7);
        for _ in 0..3 {
            assert_eq!(strict.tick().await.unwrap().sent, 0);
        }
        assert!(sink.titles().is_empty());

        let lenient = poller(&repo, &sink, 4);
        assert_eq!(lenient.tick().await.unwrap().sent, 1);
        assert_eq!(sink.titles(), vec!["Small Step"]);
    }

    #[tokio::test]
    async fn failed_send_leaves_paper_for_the_next_tick() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        repo.upsert_paper(&enriched("ok", 8, "Works")).await.unwrap();
        repo.upsert_paper(&enriched("flaky", 9, "Flaky")).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        sink.fail_titles.lock().unwrap().insert("Flaky".to_string());
        let poller = poller(&repo, &sink, 7);

        let report = poller.tick().await.unwrap();
        assert_eq!(report, TickReport { candidates: 2, sent: 1, failed: 1 });
        assert!(!repo.get_paper("flaky").await.unwrap().unwrap().posted);
        assert!(repo.post_record("flaky").await.unwrap().is_none());

        sink.fail_titles.lock().unwrap().clear();
        let report = poller.tick().await.unwrap();
        assert_eq!(report, TickReport { candidates: 1, sent: 1, failed: 0 });
        assert_eq!(sink.titles(), vec!["Works", "Flaky"]);
    }

    #[tokio::test]
    async fn only_unposted_papers_above_threshold_are_sent() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        for (id, score) in [("s10", 10), ("s7", 7), ("s6", 6), ("s1", 1)] {
            repo.upsert_paper(&enriched(id, score, id)).await.unwrap();
        }
        repo.mark_posted("s10", 1, "earlier").await.unwrap();
        let sink = Arc::new(RecordingSink::default());

        poller(&repo, &sink, 7).tick().await.unwrap();
        assert_eq!(sink.titles(), vec!["s7"]);
    }

    #[tokio::test]
    async fn pruned_and_refetched_paper_is_not_posted_again() {
        let (_dir, repo) = temp_repository().await;
        let repo = Arc::new(repo);
        let paper = enriched("2610.10003", 9, "Pruned Then Refetched");
        repo.upsert_paper(&paper).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let poller = poller(&repo, &sink, 7);

        assert_eq!(poller.tick().await.unwrap().sent, 1);
        let cutoff = paper.raw.published_at + chrono::Duration::days(1);
        assert_eq!(repo.prune_older_than(cutoff).await.unwrap(), 1);
        repo.upsert_paper(&paper).await.unwrap();

        assert_eq!(poller.tick().await.unwrap(), TickReport::default());
        assert_eq!(sink.titles(), vec!["Pruned Then Refetched"]);
    }
}
