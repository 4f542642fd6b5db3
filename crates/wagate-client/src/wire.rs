//! Sidecar wire types. Internal to this crate.

use serde::{Deserialize, Serialize};
use wagate_core::message::MediaKind;
use wagate_core::traits::ClientState;

/// One batch of events from the long-poll feed.
#[derive(Debug, Deserialize)]
pub(crate) struct EventBatch {
    pub cursor: u64,
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireEvent {
    Qr {
        data: String,
    },
    Authenticated,
    Ready,
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Message {
        id: String,
        chat_id: String,
        sender_id: String,
        #[serde(default)]
        body: String,
        timestamp: String,
        #[serde(default)]
        quoted_id: Option<String>,
        #[serde(default)]
        quoted_body: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub(crate) struct SendTextBody<'a> {
    pub chat_id: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct SendMediaBody<'a> {
    pub chat_id: &'a str,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<&'a str>,
    /// Base64-encoded bytes when no URL is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StateBody {
    pub state: ClientState,
}
