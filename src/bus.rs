//! In-process typed event bus with WebSocket fanout on the other end.
//!
//! Built on `tokio::sync::broadcast`: publishing never blocks, and slow
//! subscribers drop events instead of back-pressuring producers.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events pushed to dashboard WebSocket connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Qr {
        qr_png_dataurl: String,
        generated_at: String,
    },
    Ready {},
    Authenticated {},
    Logout {},
    Log {
        level: String,
        message: String,
        timestamp: String,
    },
    BroadcastStatus {
        broadcast_id: String,
        execution_id: String,
        status: String,
        total: i64,
        sent: i64,
        failed: i64,
        current_index: i64,
        /// Fraction of contacts handled so far, 0.0..=1.0.
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_contact: Option<String>,
    },
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    /// Convenience for log-line events.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(GatewayEvent::Log {
            level: level.to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(GatewayEvent::Ready {});
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::Ready {}));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.log("info", "nobody listening");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(GatewayEvent::BroadcastStatus {
            broadcast_id: "broadcast_1".into(),
            execution_id: "e1".into(),
            status: "running".into(),
            total: 3,
            sent: 1,
            failed: 0,
            current_index: 1,
            progress: 1.0 / 3.0,
            current_contact: Some("Alice".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "broadcast_status");
        assert_eq!(json["current_index"], 1);

        let qr = serde_json::to_value(GatewayEvent::Qr {
            qr_png_dataurl: "data:image/png;base64,xxx".into(),
            generated_at: "2025-06-11T09:00:00Z".into(),
        })
        .unwrap();
        assert_eq!(qr["type"], "qr");
    }
}
