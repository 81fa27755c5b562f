use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use crate::ai::ClaudeScorer;
use crate::bot::{self, CommandHandler, FeedPoller, QueryHandler};
use crate::config::{mask_secret, Config};
use crate::db::Repository;
use crate::discord::{DiscordRest, Gateway, GatewayEvent};
use crate::error::{AppError, Result};
use crate::feed::ArxivFetcher;
use crate::pipeline::{Enricher, IngestJob, IngestStats};
use crate::services::{Embedder, HttpEmbedder};

const EVENT_BUFFER: usize = 64;
const CHECK_EMBED_TEXT: &str = "Attention is all you need.";

/// Shared services for every run mode.
pub struct App {
    config: Config,
    repository: Arc<Repository>,
    embedder: Arc<HttpEmbedder>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let repository = Arc::new(Repository::new(&config.db_path).await?);
        let embedder = Arc::new(HttpEmbedder::new(&config.embed_api_url)?);

        Ok(Self {
            config,
            repository,
            embedder,
        })
    }

    /// The scheduled batch job: fetch, enrich, store.
    pub async fn fetch_papers(&self, reenrich: bool) -> Result<IngestStats> {
        let api_key = self.config.require_scoring()?;

        let fetcher = ArxivFetcher::new(&self.config)?;
        let papers = fetcher.fetch_recent(Utc::now()).await?;

        let scorer = ClaudeScorer::new(api_key.to_string(), self.config.claude_model.clone())?;
        let enricher = Enricher::new(
            Arc::new(scorer),
            self.embedder.clone(),
            self.config.embed_batch_size,
            self.config.llm_pause_every,
            Duration::from_secs(self.config.llm_pause_secs),
        );

        IngestJob::new(Arc::clone(&self.repository), enricher, reenrich)
            .run(papers)
            .await
    }

    /// Deletes papers published more than `days` days ago.
    pub async fn prune(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let deleted = self.repository.prune_older_than(cutoff).await?;
        tracing::info!("Pruned {} papers published before {}", deleted, cutoff);
        Ok(deleted)
    }

    /// Reaches every collaborator once and prints what it found. Missing
    /// optional credentials are reported, not counted as failures.
    pub async fn check(&self) -> Result<()> {
        let mut failures = 0;

        match self.repository.count().await {
            Ok(n) => println!("store      ok   {} papers in {}", n, self.config.db_path),
            Err(e) => {
                failures += 1;
                println!("store      FAIL {}", e);
            }
        }

        match self.embedder.health().await {
            Ok(health) => println!(
                "embedder   ok   status {} model {} dimensions {}",
                health.status,
                health.model.as_deref().unwrap_or("?"),
                health.dimensions.map(|d| d.to_string()).unwrap_or_else(|| "?".to_string())
            ),
            Err(e) => {
                failures += 1;
                println!("embedder   FAIL {}", e);
            }
        }
        match self.embedder.embed(CHECK_EMBED_TEXT).await {
            Ok(embedding) => println!("embedding  ok   {} values", embedding.as_slice().len()),
            Err(e) => {
                failures += 1;
                println!("embedding  FAIL {}", e);
            }
        }

        match ArxivFetcher::new(&self.config)?.check_window(Utc::now()).await {
            Ok(n) => println!("arxiv      ok   {} ({} entries in window)", self.config.arxiv_category, n),
            Err(e) => {
                failures += 1;
                println!("arxiv      FAIL {}", e);
            }
        }

        match &self.config.claude_api_key {
            Some(key) => println!(
                "claude     set  key {} model {}",
                mask_secret(key),
                self.config.claude_model
            ),
            None => println!("claude     --   CLAUDE_API_KEY not set"),
        }

        match &self.config.discord_token {
            Some(token) => match DiscordRest::new(token.clone())?.current_user().await {
                Ok(user) => println!("discord    ok   logged in as {} ({})", user.username, user.id),
                Err(e) => {
                    failures += 1;
                    println!("discord    FAIL {}", e);
                }
            },
            None => println!("discord    --   DISCORD_BOT_TOKEN not set"),
        }
        match self.config.channel_id {
            Some(channel) => println!("channel    set  {}", channel),
            None => println!("channel    --   DISCORD_CHANNEL_ID not set"),
        }

        if failures > 0 {
            return Err(anyhow!("{} checks failed", failures).into());
        }
        Ok(())
    }

    /// Long-running bot: feed poller plus slash commands until Ctrl-C or a
    /// fatal gateway error.
    pub async fn run_bot(&self) -> Result<()> {
        let (token, channel_id) = self.config.require_bot()?;
        let rest = Arc::new(DiscordRest::new(token.to_string())?);

        let poller = FeedPoller::new(
            Arc::clone(&self.repository),
            rest.clone(),
            channel_id,
            self.config.score_threshold,
            self.config.feed_batch_limit,
        );
        let poller_task = tokio::spawn(poller.run(self.config.poll_interval()));

        let embedder: Arc<dyn Embedder> = self.embedder.clone();
        let queries = QueryHandler::new(
            Arc::clone(&self.repository),
            embedder,
            self.config.similarity_floor,
            self.config.score_threshold,
        );
        let commands = Arc::new(CommandHandler::new(queries, rest.clone()));

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut gateway = Gateway::new(token.to_string()).spawn(tx);

        tracing::info!(
            "Bot started: posting score >= {} to channel {} every {} minutes",
            self.config.score_threshold.get(),
            channel_id,
            self.config.poll_interval_minutes
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                signal = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break signal.map_err(AppError::from);
                }
                event = rx.recv() => match event {
                    Some(GatewayEvent::Ready(ready)) => {
                        match rest.register_commands(&ready.application.id, &bot::definitions()).await {
                            Ok(()) => tracing::info!("Registered slash commands"),
                            Err(e) => tracing::error!("Failed to register commands: {}", e),
                        }
                    }
                    Some(GatewayEvent::Interaction(interaction)) => {
                        tokio::spawn(Arc::clone(&commands).handle(interaction));
                    }
                    // The gateway only stops on its own after a fatal close.
                    None => break match (&mut gateway).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(anyhow::Error::from(e).into()),
                    },
                },
            }
        };

        poller_task.abort();
        gateway.abort();
        result
    }
}
