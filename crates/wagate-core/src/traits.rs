use crate::error::GatewayError;
use crate::message::{InboundMessage, MediaPayload, SendReceipt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Connection state reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Connected,
    Authenticating,
    Disconnected,
    None,
    Error,
}

/// Events emitted by the client capability.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A pairing QR code was generated (raw payload, not yet rendered).
    Qr(String),
    Authenticated,
    Ready,
    AuthFailure(String),
    Disconnected(String),
    Message(InboundMessage),
}

/// The WhatsApp client capability — the only surface the gateway calls.
///
/// The browser-automation stack behind it is an external collaborator;
/// errors it surfaces are classified with
/// [`classify_client_error`](crate::error::classify_client_error).
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    /// Initialize the underlying session and start emitting events.
    ///
    /// Each call tears down any previous event stream; the returned
    /// receiver is owned by the session supervisor.
    async fn start(&self) -> Result<tokio::sync::mpsc::Receiver<ClientEvent>, GatewayError>;

    /// Tear down the underlying session. Idempotent.
    async fn destroy(&self) -> Result<(), GatewayError>;

    /// Log out of WhatsApp, invalidating the persisted session.
    async fn logout(&self) -> Result<(), GatewayError>;

    async fn state(&self) -> ClientState;

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SendReceipt, GatewayError>;

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaPayload,
    ) -> Result<SendReceipt, GatewayError>;

    /// No-op round-trip used as a keep-alive during long waits.
    async fn ping(&self) -> Result<(), GatewayError>;
}
