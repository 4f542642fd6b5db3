use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An incoming WhatsApp message, narrowed to the fields the gateway uses.
///
/// Produced at the client boundary; the raw provider object never crosses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Opaque provider message id.
    pub wa_message_id: String,
    /// Chat id; groups end `@g.us`, direct chats end `@c.us`.
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// Provider id of the quoted message, if this is a reply.
    #[serde(default)]
    pub quoted_id: Option<String>,
    /// Body of the quoted message, if available.
    #[serde(default)]
    pub quoted_body: Option<String>,
}

impl InboundMessage {
    /// Whether this message came from a group chat.
    pub fn is_group(&self) -> bool {
        self.chat_id.ends_with("@g.us")
    }

    /// Whether this message came from a direct (one-to-one) chat.
    pub fn is_direct(&self) -> bool {
        self.chat_id.ends_with("@c.us")
    }
}

/// Priority band for outbound sends. Determines send order and whether
/// human-behavior rate limits apply (`Critical` bypasses them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl SendPriority {
    /// Band index, highest priority first.
    pub fn band(self) -> usize {
        match self {
            SendPriority::Critical => 0,
            SendPriority::High => 1,
            SendPriority::Normal => 2,
            SendPriority::Low => 3,
        }
    }

    /// Expedited bands get short inter-send spacing.
    pub fn is_expedited(self) -> bool {
        matches!(self, SendPriority::Critical | SendPriority::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SendPriority::Critical => "critical",
            SendPriority::High => "high",
            SendPriority::Normal => "normal",
            SendPriority::Low => "low",
        }
    }
}

impl std::str::FromStr for SendPriority {
    type Err = crate::GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(SendPriority::Critical),
            "high" => Ok(SendPriority::High),
            "normal" => Ok(SendPriority::Normal),
            "low" => Ok(SendPriority::Low),
            other => Err(crate::GatewayError::Validation(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Media attached to an outbound send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub kind: MediaKind,
    pub source: MediaSource,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Supported outbound media kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
    Video,
    Audio,
}

/// Where the media bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Url(String),
    Bytes(Vec<u8>),
}

/// Acknowledgment returned by the client for a completed send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}
