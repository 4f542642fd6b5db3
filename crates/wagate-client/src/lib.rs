//! # wagate-client
//!
//! [`BridgeClient`] drives a co-located browser-automation sidecar over
//! loopback HTTP and narrows its events to [`ClientEvent`]. The sidecar
//! owns the headless browser, the WhatsApp Web session, and the on-disk
//! session/profile directories; this crate is the only place that speaks
//! its wire protocol.

mod wire;

use base64::Engine;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wagate_core::config::BridgeConfig;
use wagate_core::error::classify_client_error;
use wagate_core::message::{InboundMessage, MediaPayload, MediaSource, SendReceipt};
use wagate_core::traits::{ClientEvent, ClientState, WhatsAppClient};
use wagate_core::GatewayError;

use wire::{EventBatch, SendMediaBody, SendTextBody, StateBody, WireEvent};

/// WhatsApp client backed by the browser-automation sidecar.
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    poll_secs: u64,
    /// Monotonically increasing generation; stale event loops exit when
    /// the generation moves past them.
    generation: Arc<AtomicU64>,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig, session_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(35))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            poll_secs: config.event_poll_secs,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// POST a JSON body and classify any failure.
    async fn post_json<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(resp).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), GatewayError> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&serde_json::json!({ "session_id": self.session_id }))
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(resp).await?;
        Ok(())
    }

    /// Long-poll the sidecar event feed and forward into `tx`.
    ///
    /// Exits when the receiver is dropped or a newer `start()` bumps the
    /// generation. Poll failures back off one second and continue — the
    /// supervisor decides when the session itself is dead.
    async fn event_loop(
        http: reqwest::Client,
        base_url: String,
        poll_secs: u64,
        generation: Arc<AtomicU64>,
        my_generation: u64,
        tx: mpsc::Sender<ClientEvent>,
    ) {
        let mut cursor: u64 = 0;
        loop {
            if generation.load(Ordering::SeqCst) != my_generation {
                debug!("bridge event loop superseded, exiting");
                return;
            }

            let url =
                format!("{base_url}/client/events?cursor={cursor}&timeout={poll_secs}");
            let batch = match http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<EventBatch>().await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("bridge event decode failed: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                Ok(resp) => {
                    warn!("bridge event poll returned {}", resp.status());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(e) => {
                    debug!("bridge event poll failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            cursor = batch.cursor;
            for event in batch.events {
                let mapped = map_event(event);
                if let Some(mapped) = mapped {
                    if tx.send(mapped).await.is_err() {
                        debug!("bridge event receiver dropped, exiting loop");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WhatsAppClient for BridgeClient {
    async fn start(&self) -> Result<mpsc::Receiver<ClientEvent>, GatewayError> {
        self.post_empty("/client/init").await?;

        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(64);

        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let poll_secs = self.poll_secs;
        let generation = self.generation.clone();
        tokio::spawn(Self::event_loop(
            http,
            base_url,
            poll_secs,
            generation,
            my_generation,
            tx,
        ));

        info!("bridge client initialized (session {})", self.session_id);
        Ok(rx)
    }

    async fn destroy(&self) -> Result<(), GatewayError> {
        // Retire the event loop even if the sidecar call fails.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.post_empty("/client/destroy").await
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.post_empty("/client/logout").await
    }

    async fn state(&self) -> ClientState {
        let resp = self.http.get(self.url("/client/state")).send().await;
        match resp {
            Ok(resp) if resp.status().is_success() => resp
                .json::<StateBody>()
                .await
                .map(|b| b.state)
                .unwrap_or(ClientState::Error),
            _ => ClientState::None,
        }
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<SendReceipt, GatewayError> {
        let resp = self
            .post_json(
                "/client/send-text",
                &SendTextBody {
                    chat_id,
                    text,
                },
            )
            .await?;
        resp.json::<SendReceipt>()
            .await
            .map_err(|e| GatewayError::TransientClient(format!("send receipt decode: {e}")))
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaPayload,
    ) -> Result<SendReceipt, GatewayError> {
        let (url, data) = match &media.source {
            MediaSource::Url(u) => (Some(u.as_str()), None),
            MediaSource::Bytes(bytes) => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            ),
        };
        let resp = self
            .post_json(
                "/client/send-media",
                &SendMediaBody {
                    chat_id,
                    kind: media.kind,
                    url,
                    data,
                    caption: media.caption.as_deref(),
                },
            )
            .await?;
        resp.json::<SendReceipt>()
            .await
            .map_err(|e| GatewayError::TransientClient(format!("send receipt decode: {e}")))
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let resp = self
            .http
            .get(self.url("/client/ping"))
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(resp).await?;
        Ok(())
    }
}

/// Transport-level failures (connect refused, timeout) are transient.
fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::TransientClient(format!("bridge unreachable: {e}"))
}

/// Map a non-2xx sidecar response to the error taxonomy using its body.
async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        format!("bridge returned {status}")
    } else {
        body
    };
    Err(classify_client_error(&detail))
}

fn map_event(event: WireEvent) -> Option<ClientEvent> {
    match event {
        WireEvent::Qr { data } => Some(ClientEvent::Qr(data)),
        WireEvent::Authenticated => Some(ClientEvent::Authenticated),
        WireEvent::Ready => Some(ClientEvent::Ready),
        WireEvent::AuthFailure { reason } => Some(ClientEvent::AuthFailure(reason)),
        WireEvent::Disconnected { reason } => Some(ClientEvent::Disconnected(reason)),
        WireEvent::Message {
            id,
            chat_id,
            sender_id,
            body,
            timestamp,
            quoted_id,
            quoted_body,
        } => Some(ClientEvent::Message(InboundMessage {
            wa_message_id: id,
            chat_id,
            sender_id,
            body,
            timestamp: timestamp
                .parse()
                .unwrap_or_else(|_| Utc::now()),
            quoted_id,
            quoted_body,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_message_event_with_quote() {
        let raw = serde_json::json!({
            "type": "message",
            "id": "m3",
            "chat_id": "gY@g.us",
            "sender_id": "6598765432",
            "body": "Estimated valuation $480,000 to $520,000.",
            "timestamp": "2025-06-11T09:30:00Z",
            "quoted_id": "m2",
            "quoted_body": "Valuation Request:"
        });
        let event: WireEvent = serde_json::from_value(raw).unwrap();
        let Some(ClientEvent::Message(msg)) = map_event(event) else {
            panic!("expected message event");
        };
        assert_eq!(msg.wa_message_id, "m3");
        assert_eq!(msg.quoted_id.as_deref(), Some("m2"));
        assert!(msg.is_group());
    }

    #[test]
    fn maps_lifecycle_events() {
        let qr: WireEvent = serde_json::from_str(r#"{"type":"qr","data":"1@abc"}"#).unwrap();
        assert!(matches!(map_event(qr), Some(ClientEvent::Qr(d)) if d == "1@abc"));

        let ready: WireEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(map_event(ready), Some(ClientEvent::Ready)));

        let gone: WireEvent =
            serde_json::from_str(r#"{"type":"disconnected","reason":"NAVIGATION"}"#).unwrap();
        assert!(matches!(
            map_event(gone),
            Some(ClientEvent::Disconnected(r)) if r == "NAVIGATION"
        ));
    }

    #[test]
    fn state_body_parses_screaming_case() {
        let body: StateBody = serde_json::from_str(r#"{"state":"CONNECTED"}"#).unwrap();
        assert_eq!(body.state, ClientState::Connected);
    }
}
