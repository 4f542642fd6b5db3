//! Rate-update workflows: `rate_package_update`, `bank_rates_update`,
//! `interest_rate`.
//!
//! These forward the classified payload to a downstream webhook. The
//! engine-facing contract is narrow: repeats of the same message within
//! ten minutes are absorbed, and the handler never holds the receive
//! worker for more than five seconds.

use super::{Handler, HandlerCtx, HandlerPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use wagate_core::GatewayError;

/// Repeats of the same message inside this window are absorbed.
const IDEMPOTENCY_WINDOW_MINUTES: i64 = 10;
/// Hard bound on the webhook call.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RateUpdateHandler {
    kind: &'static str,
    webhook_url: Option<String>,
    http: reqwest::Client,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateUpdateHandler {
    pub fn new(kind: &'static str, webhook_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            kind,
            webhook_url,
            http,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this message id was already handled within the
    /// window; otherwise records it. Stale entries are pruned as a side
    /// effect.
    fn already_handled(&self, wa_message_id: &str, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::minutes(IDEMPOTENCY_WINDOW_MINUTES);
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, at| now - *at < window);
        if seen.contains_key(wa_message_id) {
            return true;
        }
        seen.insert(wa_message_id.to_string(), now);
        false
    }
}

#[async_trait]
impl Handler for RateUpdateHandler {
    async fn handle(
        &self,
        ctx: &HandlerCtx,
        payload: &HandlerPayload,
    ) -> Result<(), GatewayError> {
        let msg = &payload.msg;
        if self.already_handled(&msg.wa_message_id, ctx.clock.now()) {
            debug!("{}: repeat of {} absorbed", self.kind, msg.wa_message_id);
            return Ok(());
        }

        let Some(url) = self.webhook_url.as_deref() else {
            debug!("{}: no webhook configured, dropping payload", self.kind);
            return Ok(());
        };

        let body = serde_json::json!({
            "workflow": self.kind,
            "wa_message_id": msg.wa_message_id,
            "chat_id": msg.chat_id,
            "sender_id": msg.sender_id,
            "body": msg.body,
            "timestamp": msg.timestamp.to_rfc3339(),
        });

        // Fire-and-forget toward the webhook: failures are logged, not
        // surfaced, and the request timeout bounds the worker stall.
        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("{}: webhook accepted {}", self.kind, msg.wa_message_id);
            }
            Ok(resp) => {
                warn!("{}: webhook returned {}", self.kind, resp.status());
                ctx.bus
                    .log("warn", format!("{} webhook returned {}", self.kind, resp.status()));
            }
            Err(e) => {
                warn!("{}: webhook call failed: {e}", self.kind);
                ctx.bus
                    .log("warn", format!("{} webhook call failed", self.kind));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorbs_repeats_within_window() {
        let handler = RateUpdateHandler::new("bank_rates_update", None);
        let t0 = Utc::now();
        assert!(!handler.already_handled("m1", t0));
        assert!(handler.already_handled("m1", t0 + chrono::Duration::minutes(5)));
        // Past the window the id is forgotten.
        assert!(!handler.already_handled("m1", t0 + chrono::Duration::minutes(11)));
    }

    #[test]
    fn distinct_messages_are_independent() {
        let handler = RateUpdateHandler::new("interest_rate", None);
        let t0 = Utc::now();
        assert!(!handler.already_handled("m1", t0));
        assert!(!handler.already_handled("m2", t0));
    }
}
