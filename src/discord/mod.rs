mod gateway;
mod model;
mod rest;

use async_trait::async_trait;

use crate::error::Result;

pub use gateway::{Gateway, GatewayEvent};
pub use model::*;
pub use rest::DiscordRest;

/// Destination for rendered feed cards.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Posts an embed and returns the created message id.
    async fn send_embed(&self, channel_id: u64, embed: &Embed) -> Result<String>;
}
