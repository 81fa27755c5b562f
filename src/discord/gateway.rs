//! Minimal Discord gateway session: enough to receive slash command
//! interactions. Every reconnect starts a fresh session (no resume).

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AppError, Result};

use super::model::{
    GatewayPayload, Hello, Interaction, Ready, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK,
    OP_HELLO, OP_IDENTIFY, OP_INVALID_SESSION, OP_RECONNECT,
};

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Close codes after which reconnecting cannot help.
const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Ready(Ready),
    Interaction(Interaction),
}

/// What the session loop should do after a payload.
#[derive(Debug)]
enum Action {
    Nothing,
    HeartbeatAcked,
    HeartbeatNow,
    Reconnect,
    Emit(GatewayEvent),
}

#[derive(Debug)]
enum SessionEnd {
    Reconnect { was_ready: bool },
    Shutdown,
}

pub struct Gateway {
    token: String,
    url: String,
}

impl Gateway {
    pub fn new(token: String) -> Self {
        Self {
            token,
            url: GATEWAY_URL.to_string(),
        }
    }

    /// Runs sessions until the receiver is dropped or Discord rejects the
    /// credentials, reconnecting with exponential backoff in between.
    pub fn spawn(self, sender: mpsc::Sender<GatewayEvent>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match self.run_session(&sender).await {
                    Ok(SessionEnd::Shutdown) => return Ok(()),
                    Ok(SessionEnd::Reconnect { was_ready }) => {
                        tracing::info!("Gateway session ended, reconnecting");
                        if was_ready {
                            backoff = INITIAL_BACKOFF;
                        }
                    }
                    Err(AppError::DiscordApi(message)) => {
                        tracing::error!("Gateway closed permanently: {}", message);
                        return Err(AppError::DiscordApi(message));
                    }
                    Err(e) => tracing::warn!("Gateway error: {}", e),
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }

    async fn run_session(&self, sender: &mpsc::Sender<GatewayEvent>) -> Result<SessionEnd> {
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let hello = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if payload.op == OP_HELLO {
                        break serde_json::from_value::<Hello>(payload.d)?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Ok(SessionEnd::Reconnect { was_ready: false })
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        };
        tracing::debug!("Gateway hello, heartbeat every {} ms", hello.heartbeat_interval);

        write
            .send(Message::Text(identify_payload(&self.token).to_string()))
            .await?;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(hello.heartbeat_interval.max(1)));
        heartbeat.tick().await;

        let mut sequence: Option<u64> = None;
        let mut awaiting_ack = false;
        let mut was_ready = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        tracing::warn!("Gateway heartbeat not acknowledged, reconnecting");
                        return Ok(SessionEnd::Reconnect { was_ready });
                    }
                    write.send(Message::Text(heartbeat_payload(sequence).to_string())).await?;
                    awaiting_ack = true;
                }
                message = read.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                let code = u16::from(frame.code);
                                if FATAL_CLOSE_CODES.contains(&code) {
                                    return Err(AppError::DiscordApi(format!(
                                        "gateway close {}: {}",
                                        code, frame.reason
                                    )));
                                }
                                tracing::info!("Gateway closed with {}: {}", code, frame.reason);
                            }
                            return Ok(SessionEnd::Reconnect { was_ready });
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Reconnect { was_ready }),
                    };

                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if let Some(s) = payload.s {
                        sequence = Some(s);
                    }

                    match interpret(payload)? {
                        Action::Nothing => {}
                        Action::HeartbeatAcked => awaiting_ack = false,
                        Action::HeartbeatNow => {
                            write.send(Message::Text(heartbeat_payload(sequence).to_string())).await?;
                        }
                        Action::Reconnect => return Ok(SessionEnd::Reconnect { was_ready }),
                        Action::Emit(event) => {
                            if let GatewayEvent::Ready(ready) = &event {
                                tracing::info!(
                                    "Logged in as {} ({}), session {}",
                                    ready.user.username,
                                    ready.user.id,
                                    ready.session_id
                                );
                                was_ready = true;
                            }
                            if sender.send(event).await.is_err() {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": 0,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "arxiv-feed-bot",
                "device": "arxiv-feed-bot",
            },
        },
    })
}

fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

fn interpret(payload: GatewayPayload) -> Result<Action> {
    let action = match payload.op {
        OP_HEARTBEAT_ACK => Action::HeartbeatAcked,
        OP_HEARTBEAT => Action::HeartbeatNow,
        OP_RECONNECT | OP_INVALID_SESSION => Action::Reconnect,
        OP_DISPATCH => match payload.t.as_deref() {
            Some("READY") => Action::Emit(GatewayEvent::Ready(serde_json::from_value(payload.d)?)),
            Some("INTERACTION_CREATE") => {
                Action::Emit(GatewayEvent::Interaction(serde_json::from_value(payload.d)?))
            }
            _ => Action::Nothing,
        },
        _ => Action::Nothing,
    };
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: &str) -> GatewayPayload {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn identify_carries_token() {
        let identify = identify_payload("abc");
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "abc");
    }

    #[test]
    fn heartbeat_sends_last_sequence_or_null() {
        assert_eq!(heartbeat_payload(None), json!({"op": 1, "d": null}));
        assert_eq!(heartbeat_payload(Some(42)), json!({"op": 1, "d": 42}));
    }

    #[test]
    fn control_opcodes_map_to_actions() {
        assert!(matches!(interpret(payload(r#"{"op": 11}"#)).unwrap(), Action::HeartbeatAcked));
        assert!(matches!(interpret(payload(r#"{"op": 1, "d": null}"#)).unwrap(), Action::HeartbeatNow));
        assert!(matches!(interpret(payload(r#"{"op": 7, "d": null}"#)).unwrap(), Action::Reconnect));
        assert!(matches!(interpret(payload(r#"{"op": 9, "d": false}"#)).unwrap(), Action::Reconnect));
    }

    #[test]
    fn dispatches_ready_and_interactions() {
        let ready = payload(
            r#"{"op": 0, "s": 1, "t": "READY", "d": {
                "v": 10,
                "user": {"id": "9", "username": "arxiv-bot"},
                "session_id": "sess",
                "application": {"id": "77", "flags": 0},
                "guilds": []
            }}"#,
        );
        match interpret(ready).unwrap() {
            Action::Emit(GatewayEvent::Ready(ready)) => {
                assert_eq!(ready.application.id, "77");
                assert_eq!(ready.session_id, "sess");
            }
            other => panic!("unexpected {:?}", other),
        }

        let interaction = payload(
            r#"{"op": 0, "s": 2, "t": "INTERACTION_CREATE", "d": {
                "id": "1", "application_id": "77", "type": 2, "token": "t",
                "data": {"name": "stats"}
            }}"#,
        );
        match interpret(interaction).unwrap() {
            Action::Emit(GatewayEvent::Interaction(i)) => assert_eq!(i.command_name(), Some("stats")),
            other => panic!("unexpected {:?}", other),
        }

        let other = payload(r#"{"op": 0, "s": 3, "t": "GUILD_CREATE", "d": {}}"#);
        assert!(matches!(interpret(other).unwrap(), Action::Nothing));
    }
}
