use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HubError, Result};

/// Address of the hub itself.
pub const SERVER: &str = "server";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "initialize")]
    Initialize,
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "async")]
    Async,
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "response.resolved")]
    ResponseResolved,
    #[serde(rename = "response.rejected")]
    ResponseRejected,
    #[serde(rename = "response.timedout")]
    ResponseTimedout,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Initialize => "initialize",
            MessageType::Default => "default",
            MessageType::Async => "async",
            MessageType::Broadcast => "broadcast",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::ResponseResolved => "response.resolved",
            MessageType::ResponseRejected => "response.rejected",
            MessageType::ResponseTimedout => "response.timedout",
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::ResponseResolved
                | MessageType::ResponseRejected
                | MessageType::ResponseTimedout
        )
    }

    /// Types the protocol consumes itself instead of surfacing to the application.
    pub fn is_system(&self) -> bool {
        self.is_response()
            || matches!(
                self,
                MessageType::Initialize | MessageType::Ping | MessageType::Pong
            )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    pub fn new(
        kind: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            uuid: new_id(),
            kind,
            from: from.into(),
            to: to.into(),
            content,
        }
    }

    /// A correlated response to `self`, sharing its uuid and travelling back to the sender.
    pub fn response(&self, kind: MessageType, content: Value) -> Self {
        Self {
            uuid: self.uuid.clone(),
            kind,
            from: self.to.clone(),
            to: self.from.clone(),
            content,
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Parses one wire frame. The `from` field is kept as sent; callers that know the
/// sender's verified identity must overwrite it.
pub fn decode(raw: &str) -> Result<Envelope> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| HubError::Codec(e.to_string()))?;
    if envelope.uuid.trim().is_empty() {
        return Err(HubError::Codec("envelope uuid is empty".to_string()));
    }
    Ok(envelope)
}

pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| HubError::Codec(e.to_string()))
}
