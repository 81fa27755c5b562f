use serde::{Deserialize, Serialize};
use serde_json::Value;

// Gateway opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

pub const INTERACTION_APPLICATION_COMMAND: u8 = 2;
pub const CALLBACK_DEFERRED_CHANNEL_MESSAGE: u8 = 5;

pub const COMMAND_CHAT_INPUT: u8 = 1;
pub const OPTION_STRING: u8 = 3;
pub const OPTION_INTEGER: u8 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartialApplication {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub user: User,
    pub application: PartialApplication,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub application_id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub token: String,
    #[serde(default)]
    pub data: Option<CommandData>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[allow(dead_code)]
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Interaction {
    pub fn command_name(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.name.as_str())
    }

    fn option(&self, name: &str) -> Option<&Value> {
        self.data
            .as_ref()?
            .options
            .iter()
            .find(|o| o.name == name)?
            .value
            .as_ref()
    }

    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.option(name)?.as_str()
    }

    pub fn option_i64(&self, name: &str) -> Option<i64> {
        self.option(name)?.as_i64()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Slash command registration body.
#[derive(Debug, Clone, Serialize)]
pub struct CommandDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionDefinition {
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedMessage {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_interaction_options() {
        let raw = r#"{
            "id": "111",
            "application_id": "222",
            "type": 2,
            "token": "tok",
            "channel_id": "333",
            "data": {
                "id": "444",
                "name": "search",
                "type": 1,
                "options": [
                    {"name": "query", "type": 3, "value": "diffusion models"},
                    {"name": "limit", "type": 4, "value": 3}
                ]
            }
        }"#;
        let interaction: Interaction = serde_json::from_str(raw).unwrap();
        assert_eq!(interaction.kind, INTERACTION_APPLICATION_COMMAND);
        assert_eq!(interaction.command_name(), Some("search"));
        assert_eq!(interaction.option_str("query"), Some("diffusion models"));
        assert_eq!(interaction.option_i64("limit"), Some(3));
        assert_eq!(interaction.option_i64("missing"), None);
    }

    #[test]
    fn empty_embed_parts_are_not_serialized() {
        let embed = Embed {
            title: Some("t".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&embed).unwrap(), serde_json::json!({"title": "t"}));
    }
}
