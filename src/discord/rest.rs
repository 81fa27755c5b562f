use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{AppError, Result};

use super::model::{
    CommandDefinition, CreatedMessage, Embed, Interaction, User, CALLBACK_DEFERRED_CHANNEL_MESSAGE,
};
use super::ChatSink;

const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// Discord HTTP API client authenticated as the bot.
pub struct DiscordRest {
    client: Client,
    token: String,
}

impl DiscordRest {
    pub fn new(token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("DiscordBot (https://github.com/arxiv-feed-bot, 1.0)")
            .build()?;
        Ok(Self { client, token })
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let mut request = self
            .client
            .request(method, format!("{}{}", DISCORD_API_URL, path))
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::DiscordApi(format!("{} {}: {}", status, path, error_text)));
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn request_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> Result<T> {
        let value = self
            .request(method, path, body)
            .await?
            .ok_or_else(|| AppError::DiscordApi(format!("empty response from {}", path)))?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn current_user(&self) -> Result<User> {
        self.request_json(Method::GET, "/users/@me", None).await
    }

    /// Overwrites the application's global slash commands.
    pub async fn register_commands(&self, application_id: &str, commands: &[CommandDefinition]) -> Result<()> {
        let body = serde_json::to_value(commands)?;
        self.request(
            Method::PUT,
            &format!("/applications/{}/commands", application_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Acknowledges an interaction; the answer follows via
    /// `edit_original_response`.
    pub async fn defer_interaction(&self, interaction: &Interaction) -> Result<()> {
        let body = json!({ "type": CALLBACK_DEFERRED_CHANNEL_MESSAGE });
        self.request(
            Method::POST,
            &format!("/interactions/{}/{}/callback", interaction.id, interaction.token),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn edit_original_response(
        &self,
        interaction: &Interaction,
        content: Option<&str>,
        embeds: &[Embed],
    ) -> Result<()> {
        let body = json!({
            "content": content.unwrap_or(""),
            "embeds": embeds,
        });
        self.request(
            Method::PATCH,
            &format!(
                "/webhooks/{}/{}/messages/@original",
                interaction.application_id, interaction.token
            ),
            Some(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatSink for DiscordRest {
    async fn send_embed(&self, channel_id: u64, embed: &Embed) -> Result<String> {
        let body = json!({ "embeds": [embed] });
        let message: CreatedMessage = self
            .request_json(
                Method::POST,
                &format!("/channels/{}/messages", channel_id),
                Some(&body),
            )
            .await?;
        Ok(message.id)
    }
}
