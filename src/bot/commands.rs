use std::sync::Arc;

use crate::discord::{
    CommandDefinition, DiscordRest, Embed, Interaction, OptionDefinition, COMMAND_CHAT_INPUT,
    INTERACTION_APPLICATION_COMMAND, OPTION_INTEGER, OPTION_STRING,
};
use crate::error::{AppError, Result};

use super::query::{QueryHandler, MAX_LIMIT};
use super::render;

const FAILURE_REPLY: &str = "Something went wrong while handling that command. Please try again later.";

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Search { query: String, limit: Option<i64> },
    Latest { limit: Option<i64> },
    Stats,
}

impl Command {
    pub fn from_interaction(interaction: &Interaction) -> Result<Self> {
        if interaction.kind != INTERACTION_APPLICATION_COMMAND {
            return Err(AppError::InvalidInput(format!(
                "unsupported interaction type {}",
                interaction.kind
            )));
        }

        match interaction.command_name() {
            Some("search") => {
                let query = interaction
                    .option_str("query")
                    .ok_or_else(|| AppError::InvalidInput("search needs a query".to_string()))?;
                Ok(Command::Search {
                    query: query.to_string(),
                    limit: interaction.option_i64("limit"),
                })
            }
            Some("latest") => Ok(Command::Latest {
                limit: interaction.option_i64("limit"),
            }),
            Some("stats") => Ok(Command::Stats),
            Some(other) => Err(AppError::InvalidInput(format!("unknown command /{}", other))),
            None => Err(AppError::InvalidInput("interaction has no command".to_string())),
        }
    }
}

/// The global command set registered on startup.
pub fn definitions() -> Vec<CommandDefinition> {
    let limit = |description: &str| OptionDefinition {
        kind: OPTION_INTEGER,
        name: "limit".to_string(),
        description: description.to_string(),
        required: false,
        min_value: Some(1),
        max_value: Some(MAX_LIMIT as i64),
        max_length: None,
    };

    vec![
        CommandDefinition {
            name: "search".to_string(),
            description: "Semantic search over stored papers".to_string(),
            kind: COMMAND_CHAT_INPUT,
            options: vec![
                OptionDefinition {
                    kind: OPTION_STRING,
                    name: "query".to_string(),
                    description: "What to look for".to_string(),
                    required: true,
                    min_value: None,
                    max_value: None,
                    max_length: Some(render::QUERY_ECHO_LIMIT as u32),
                },
                limit("Number of results (default 5)"),
            ],
        },
        CommandDefinition {
            name: "latest".to_string(),
            description: "Most recently published papers".to_string(),
            kind: COMMAND_CHAT_INPUT,
            options: vec![limit("Number of papers (default 5)")],
        },
        CommandDefinition {
            name: "stats".to_string(),
            description: "Feed statistics".to_string(),
            kind: COMMAND_CHAT_INPUT,
            options: Vec::new(),
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
}

pub struct CommandHandler {
    queries: QueryHandler,
    rest: Arc<DiscordRest>,
}

impl CommandHandler {
    pub fn new(queries: QueryHandler, rest: Arc<DiscordRest>) -> Self {
        Self { queries, rest }
    }

    pub async fn execute(&self, command: Command) -> Result<Reply> {
        match command {
            Command::Search { query, limit } => {
                let hits = self.queries.search(&query, limit).await?;
                Ok(Reply {
                    content: Some(render::search_header(query.trim(), &hits)),
                    embeds: render::search_results(&hits),
                })
            }
            Command::Latest { limit } => {
                let papers = self.queries.latest(limit).await?;
                let content = if papers.is_empty() {
                    "No papers stored yet.".to_string()
                } else {
                    format!("{} most recent papers:", papers.len())
                };
                Ok(Reply {
                    content: Some(content),
                    embeds: render::latest_list(&papers),
                })
            }
            Command::Stats => {
                let stats = self.queries.stats().await?;
                Ok(Reply {
                    content: None,
                    embeds: vec![render::stats_embed(&stats, self.queries.threshold())],
                })
            }
        }
    }

    /// Defers, runs and answers one interaction. Failures are logged and
    /// reported back to the user.
    pub async fn handle(self: Arc<Self>, interaction: Interaction) {
        if let Err(e) = self.rest.defer_interaction(&interaction).await {
            tracing::error!("Failed to defer interaction {}: {}", interaction.id, e);
            return;
        }

        let reply = match Command::from_interaction(&interaction) {
            Ok(command) => {
                tracing::info!("Handling {:?} from channel {:?}", command, interaction.channel_id);
                self.execute(command).await
            }
            Err(e) => Err(e),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(AppError::InvalidInput(message)) => Reply {
                content: Some(format!("Invalid request: {}", message)),
                embeds: Vec::new(),
            },
            Err(e) => {
                tracing::error!("Command in interaction {} failed: {}", interaction.id, e);
                Reply {
                    content: Some(FAILURE_REPLY.to_string()),
                    embeds: Vec::new(),
                }
            }
        };

        if let Err(e) = self
            .rest
            .edit_original_response(&interaction, reply.content.as_deref(), &reply.embeds)
            .await
        {
            tracing::error!("Failed to answer interaction {}: {}", interaction.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::query::tests::FakeEmbedder;
    use crate::db::test_support::{axis_embedding, enriched, temp_repository};
    use crate::models::ImpactScore;
    use serde_json::json;

    fn interaction(data: serde_json::Value) -> Interaction {
        serde_json::from_value(json!({
            "id": "1",
            "application_id": "2",
            "type": 2,
            "token": "tok",
            "data": data,
        }))
        .unwrap()
    }

    async fn handler() -> (tempfile::TempDir, CommandHandler) {
        let (dir, repo) = temp_repository().await;
        repo.upsert_paper(&enriched("2610.30001", 9, "Scaling Laws Revisited")).await.unwrap();
        repo.upsert_paper(&enriched("2610.30002", 5, "A Note on Tokenizers")).await.unwrap();
        let queries = QueryHandler::new(
            Arc::new(repo),
            Arc::new(FakeEmbedder::new(axis_embedding(0, 0.0))),
            0.3,
            ImpactScore::new(7).unwrap(),
        );
        let rest = Arc::new(DiscordRest::new("test-token".to_string()).unwrap());
        (dir, CommandHandler::new(queries, rest))
    }

    #[test]
    fn parses_each_command() {
        let search = interaction(json!({
            "name": "search",
            "options": [
                {"name": "query", "type": 3, "value": "sparse attention"},
                {"name": "limit", "type": 4, "value": 3}
            ]
        }));
        assert_eq!(
            Command::from_interaction(&search).unwrap(),
            Command::Search {
                query: "sparse attention".to_string(),
                limit: Some(3)
            }
        );

        let latest = interaction(json!({"name": "latest"}));
        assert_eq!(Command::from_interaction(&latest).unwrap(), Command::Latest { limit: None });

        let stats = interaction(json!({"name": "stats"}));
        assert_eq!(Command::from_interaction(&stats).unwrap(), Command::Stats);
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        let unknown = interaction(json!({"name": "dance"}));
        assert!(matches!(
            Command::from_interaction(&unknown),
            Err(AppError::InvalidInput(_))
        ));

        let no_query = interaction(json!({"name": "search"}));
        assert!(Command::from_interaction(&no_query).is_err());

        let mut ping = interaction(json!({"name": "stats"}));
        ping.kind = 1;
        assert!(Command::from_interaction(&ping).is_err());
    }

    #[test]
    fn definitions_cover_three_commands() {
        let defs = definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["search", "latest", "stats"]);

        let body = serde_json::to_value(&defs).unwrap();
        assert_eq!(body[0]["options"][0]["required"], true);
        assert_eq!(body[0]["options"][0]["max_length"], 200);
        assert!(body[0]["options"][1].get("max_length").is_none());
        assert_eq!(body[0]["options"][1]["max_value"], 10);
        assert!(body[2].get("options").is_none());
    }

    #[tokio::test]
    async fn search_reply_lists_hits() {
        let (_dir, handler) = handler().await;
        let reply = handler
            .execute(Command::Search {
                query: "scaling".to_string(),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(reply.embeds.len(), 1);
        assert!(reply.content.unwrap().starts_with("Top 1 papers"));
    }

    #[tokio::test]
    async fn oversized_query_reply_fits_discord_content() {
        let (_dir, handler) = handler().await;
        let reply = handler
            .execute(Command::Search {
                query: "scaling ".repeat(300),
                limit: None,
            })
            .await
            .unwrap();
        assert!(reply.content.unwrap().chars().count() <= 2000);
    }

    #[tokio::test]
    async fn latest_and_stats_replies() {
        let (_dir, handler) = handler().await;

        let latest = handler.execute(Command::Latest { limit: None }).await.unwrap();
        assert_eq!(latest.embeds.len(), 2);
        assert_eq!(latest.content.as_deref(), Some("2 most recent papers:"));

        let stats = handler.execute(Command::Stats).await.unwrap();
        assert_eq!(stats.embeds.len(), 1);
        assert_eq!(stats.embeds[0].fields[0].value, "2");
        assert_eq!(stats.embeds[0].fields[3].value, "1");
    }
}
