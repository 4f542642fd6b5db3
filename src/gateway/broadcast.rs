//! Broadcast executor: long-running paced campaigns that share the send
//! worker with normal traffic.
//!
//! Progress is persisted after every contact so a crash loses at most one
//! recipient's worth of state; cancellation and shutdown both leave a
//! consistent execution row behind.

use crate::bus::{EventBus, GatewayEvent};
use crate::gateway::sendq::{SendQueue, SendRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use wagate_core::clock::Clock;
use wagate_core::message::{MediaKind, MediaPayload, MediaSource, SendPriority};
use wagate_core::traits::WhatsAppClient;
use wagate_core::GatewayError;
use wagate_store::broadcasts::{BroadcastRecipient, NewBroadcast};
use wagate_store::contacts::normalize_phone;
use wagate_store::Store;

/// Keep-alive cadence inside the inter-contact wait.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(30);

/// One contact as submitted by the control plane.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BroadcastContact {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub phone: String,
}

/// Campaign parameters from the control plane.
#[derive(Debug, Clone)]
pub struct BroadcastInput {
    pub contacts: Vec<BroadcastContact>,
    pub message: String,
    pub image_url: Option<String>,
    pub delay_mode: String,
    pub notification_contact: Option<String>,
}

/// What the caller gets back once the campaign is preflighted.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcastStarted {
    pub broadcast_id: String,
    pub execution_id: String,
    pub total: i64,
    pub delay_mode: String,
}

struct CancelFlag {
    cancelled: AtomicBool,
    /// Set when the cancellation came from process shutdown; the
    /// execution then finalizes as `failed` with reason `shutdown`.
    shutdown: AtomicBool,
}

pub struct BroadcastManager {
    store: Store,
    sendq: Arc<SendQueue>,
    client: Arc<dyn WhatsAppClient>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    cancels: Mutex<HashMap<String, Arc<CancelFlag>>>,
}

impl BroadcastManager {
    pub fn new(
        store: Store,
        sendq: Arc<SendQueue>,
        client: Arc<dyn WhatsAppClient>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sendq,
            client,
            bus,
            clock,
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Preflight a campaign and start it in the background.
    pub async fn start(
        self: &Arc<Self>,
        input: BroadcastInput,
    ) -> Result<BroadcastStarted, GatewayError> {
        if input.contacts.is_empty() {
            return Err(GatewayError::Validation("contacts list is empty".into()));
        }
        if input.message.trim().is_empty() {
            return Err(GatewayError::Validation("message is empty".into()));
        }
        let delay_range = delay_range(&input.delay_mode)?;

        let mut recipients = Vec::with_capacity(input.contacts.len());
        for (i, contact) in input.contacts.iter().enumerate() {
            let phone = normalize_phone(&contact.phone).map_err(|_| {
                GatewayError::Validation(format!("contact #{} has an invalid phone", i + 1))
            })?;
            recipients.push(BroadcastRecipient {
                contact_id: contact.id.clone(),
                name: contact.name.clone(),
                phone,
            });
        }

        let broadcast_id = format!("broadcast_{}", Uuid::new_v4().simple());
        let execution = self
            .store
            .create_broadcast(
                &NewBroadcast {
                    broadcast_id: broadcast_id.clone(),
                    message_content: input.message.clone(),
                    image_url: input.image_url.clone(),
                    delay_mode: input.delay_mode.clone(),
                    notification_contact: input.notification_contact.clone(),
                },
                &recipients,
            )
            .await?;

        let flag = Arc::new(CancelFlag {
            cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        self.cancels
            .lock()
            .unwrap()
            .insert(execution.id.clone(), flag.clone());

        info!(
            "broadcast {} started: {} contacts, {}",
            broadcast_id, execution.total_contacts, input.delay_mode
        );
        self.bus.log(
            "info",
            format!(
                "broadcast {broadcast_id} started ({} contacts)",
                execution.total_contacts
            ),
        );

        let runner = self.clone();
        let started = BroadcastStarted {
            broadcast_id: broadcast_id.clone(),
            execution_id: execution.id.clone(),
            total: execution.total_contacts,
            delay_mode: input.delay_mode.clone(),
        };
        tokio::spawn(async move {
            runner
                .run(execution.id, broadcast_id, input, delay_range, flag)
                .await;
        });

        Ok(started)
    }

    /// Request cancellation of a running campaign.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let cancels = self.cancels.lock().unwrap();
        match cancels.get(execution_id) {
            Some(flag) => {
                flag.cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Graceful shutdown: abort every running campaign as `failed`.
    pub fn cancel_all_for_shutdown(&self) {
        for flag in self.cancels.lock().unwrap().values() {
            flag.shutdown.store(true, Ordering::SeqCst);
            flag.cancelled.store(true, Ordering::SeqCst);
        }
    }

    async fn run(
        self: Arc<Self>,
        execution_id: String,
        broadcast_id: String,
        input: BroadcastInput,
        delay_range: (Duration, Duration),
        flag: Arc<CancelFlag>,
    ) {
        let outcome = self
            .run_inner(&execution_id, &broadcast_id, &input, delay_range, &flag)
            .await;

        if let Err(e) = outcome {
            warn!("broadcast {broadcast_id} infrastructure failure: {e}");
            let _ = self
                .store
                .finalize_broadcast(&execution_id, "failed", Some(&e.to_string()))
                .await;
            self.emit_terminal(&execution_id, &broadcast_id, "failed").await;
            self.send_summary(&execution_id, &broadcast_id, &input).await;
        }

        self.cancels.lock().unwrap().remove(&execution_id);
    }

    async fn run_inner(
        &self,
        execution_id: &str,
        broadcast_id: &str,
        input: &BroadcastInput,
        delay_range: (Duration, Duration),
        flag: &CancelFlag,
    ) -> Result<(), GatewayError> {
        let messages = self.store.list_broadcast_messages(execution_id).await?;
        let total = messages.len() as i64;
        let mut sent: i64 = 0;
        let mut failed: i64 = 0;
        let mut last_ok: Option<String> = None;

        for (i, row) in messages.iter().enumerate() {
            if flag.cancelled.load(Ordering::SeqCst) {
                let (status, error) = if flag.shutdown.load(Ordering::SeqCst) {
                    ("failed", Some("shutdown"))
                } else {
                    ("cancelled", None)
                };
                info!("broadcast {broadcast_id} stopped at {i}/{total}: {status}");
                self.store
                    .finalize_broadcast(execution_id, status, error)
                    .await?;
                self.emit_terminal(execution_id, broadcast_id, status).await;
                self.send_summary(execution_id, broadcast_id, input).await;
                return Ok(());
            }

            self.store.mark_broadcast_message_sending(&row.id).await?;

            let personalized = personalize(&input.message, &row.recipient_name);
            let target = format!("{}@c.us", row.recipient_phone);
            let request = match &input.image_url {
                Some(url) => SendRequest {
                    target_chat_id: target,
                    text: None,
                    media: Some(MediaPayload {
                        kind: MediaKind::Image,
                        source: MediaSource::Url(url.clone()),
                        caption: Some(personalized),
                    }),
                    priority: SendPriority::Low,
                },
                None => SendRequest::text(target, personalized, SendPriority::Low),
            };

            match self.sendq.send(request).await {
                Ok(_receipt) => {
                    sent += 1;
                    last_ok = Some(row.recipient_name.clone());
                    self.store.mark_broadcast_message_sent(&row.id).await?;
                    self.store
                        .update_broadcast_progress(execution_id, i as i64 + 1, sent, failed, true)
                        .await?;
                }
                Err(e) => {
                    failed += 1;
                    self.store
                        .mark_broadcast_message_failed(&row.id, &e.to_string())
                        .await?;
                    self.store
                        .update_broadcast_progress(execution_id, i as i64 + 1, sent, failed, false)
                        .await?;
                }
            }

            self.bus.publish(GatewayEvent::BroadcastStatus {
                broadcast_id: broadcast_id.to_string(),
                execution_id: execution_id.to_string(),
                status: "running".into(),
                total,
                sent,
                failed,
                current_index: i as i64 + 1,
                progress: (i as f64 + 1.0) / total as f64,
                current_contact: Some(row.recipient_name.clone()),
            });

            if (i as i64) < total - 1 {
                let wait = self.clock.uniform(delay_range.0, delay_range.1);
                self.wait_with_keepalive(wait, flag).await;
            }
        }

        self.store
            .finalize_broadcast(execution_id, "completed", None)
            .await?;
        info!("broadcast {broadcast_id} completed: {sent} sent, {failed} failed");
        self.emit_terminal(execution_id, broadcast_id, "completed").await;
        self.send_summary_with_last(execution_id, broadcast_id, input, last_ok)
            .await;
        Ok(())
    }

    /// Sleep `total`, pinging the client every 30s so the underlying
    /// session is not reclaimed during the long gap. A failed ping is
    /// logged and the wait continues.
    async fn wait_with_keepalive(&self, total: Duration, flag: &CancelFlag) {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            let slice = remaining.min(KEEPALIVE_EVERY);
            self.clock.sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
            if flag.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if remaining > Duration::ZERO {
                if let Err(e) = self.client.ping().await {
                    warn!("keep-alive ping failed during broadcast wait: {e}");
                }
            }
        }
    }

    async fn emit_terminal(&self, execution_id: &str, broadcast_id: &str, status: &str) {
        if let Ok(exec) = self.store.get_broadcast_execution(execution_id).await {
            self.bus.publish(GatewayEvent::BroadcastStatus {
                broadcast_id: broadcast_id.to_string(),
                execution_id: execution_id.to_string(),
                status: status.to_string(),
                total: exec.total_contacts,
                sent: exec.sent_count,
                failed: exec.failed_count,
                current_index: exec.current_index,
                progress: if exec.total_contacts > 0 {
                    exec.current_index as f64 / exec.total_contacts as f64
                } else {
                    1.0
                },
                current_contact: None,
            });
        }
    }

    async fn send_summary(&self, execution_id: &str, broadcast_id: &str, input: &BroadcastInput) {
        self.send_summary_with_last(execution_id, broadcast_id, input, None)
            .await;
    }

    /// Completion / failure notification to the configured contact.
    async fn send_summary_with_last(
        &self,
        execution_id: &str,
        broadcast_id: &str,
        input: &BroadcastInput,
        last_ok: Option<String>,
    ) {
        let Some(contact) = input.notification_contact.as_deref() else {
            return;
        };
        let Ok(phone) = normalize_phone(contact) else {
            warn!("broadcast notification contact is not a valid phone");
            return;
        };
        let Ok(exec) = self.store.get_broadcast_execution(execution_id).await else {
            return;
        };

        let mut text = format!(
            "Broadcast {broadcast_id} {}: {} sent, {} failed of {} contacts.",
            exec.status, exec.sent_count, exec.failed_count, exec.total_contacts
        );
        if let Some(name) = last_ok {
            text.push_str(&format!(" Last successful recipient: {name}."));
        }

        if let Err(e) = self
            .sendq
            .send(SendRequest::text(
                format!("{phone}@c.us"),
                text,
                SendPriority::Critical,
            ))
            .await
        {
            warn!("broadcast summary send failed: {e}");
        }
    }
}

/// Substitute `{name}` with the contact's name, defaulting to
/// "Valued Customer".
fn personalize(message: &str, name: &str) -> String {
    let name = if name.trim().is_empty() {
        "Valued Customer"
    } else {
        name.trim()
    };
    message.replace("{name}", name)
}

/// Map a delay mode to its inter-contact wait range.
fn delay_range(mode: &str) -> Result<(Duration, Duration), GatewayError> {
    match mode {
        "1-2min" => Ok((Duration::from_secs(60), Duration::from_secs(120))),
        "2-3min" => Ok((Duration::from_secs(120), Duration::from_secs(180))),
        other => Err(GatewayError::Validation(format!(
            "unknown delay_mode '{other}' (expected \"1-2min\" or \"2-3min\")"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sendq::tests_support::{ready_queue_with, AlwaysOkClient};
    use chrono::Utc;
    use wagate_behavior::HumanBehavior;
    use wagate_core::clock::testing::FakeClock;
    use wagate_core::config::BehaviorConfig;

    fn contacts(n: usize) -> Vec<BroadcastContact> {
        (0..n)
            .map(|i| BroadcastContact {
                id: None,
                name: format!("Contact {i}"),
                phone: format!("9123456{i}"),
            })
            .collect()
    }

    struct Fixture {
        manager: Arc<BroadcastManager>,
        store: Store,
        client: Arc<AlwaysOkClient>,
        clock: Arc<FakeClock>,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FakeClock::at(Utc::now()));
        let behavior = Arc::new(HumanBehavior::new(BehaviorConfig::default(), clock.clone()));
        let (sendq, client) = ready_queue_with(behavior, clock.clone());
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(64);
        let manager = BroadcastManager::new(
            store.clone(),
            sendq,
            client.clone(),
            bus.clone(),
            clock.clone(),
        );
        Fixture {
            manager,
            store,
            client,
            clock,
            bus,
        }
    }

    #[test]
    fn personalization_defaults_and_substitutes() {
        assert_eq!(personalize("Hi {name}!", "Alice"), "Hi Alice!");
        assert_eq!(personalize("Hi {name}!", "  "), "Hi Valued Customer!");
        assert_eq!(personalize("No placeholder", "Alice"), "No placeholder");
    }

    #[test]
    fn delay_modes_map_to_ranges() {
        assert_eq!(
            delay_range("1-2min").unwrap(),
            (Duration::from_secs(60), Duration::from_secs(120))
        );
        assert_eq!(
            delay_range("2-3min").unwrap(),
            (Duration::from_secs(120), Duration::from_secs(180))
        );
        assert!(delay_range("5min").is_err());
    }

    #[tokio::test]
    async fn completes_three_contact_campaign() {
        let fx = fixture().await;
        let mut events = fx.bus.subscribe();

        let started = fx
            .manager
            .start(BroadcastInput {
                contacts: contacts(3),
                message: "Hi {name}, rates attached.".into(),
                image_url: None,
                delay_mode: "1-2min".into(),
                notification_contact: None,
            })
            .await
            .unwrap();
        assert!(started.broadcast_id.starts_with("broadcast_"));
        assert_eq!(started.total, 3);

        // Let the runner drain (all waits are virtual).
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exec = fx
            .store
            .get_broadcast_execution(&started.execution_id)
            .await
            .unwrap();
        assert_eq!(exec.status, "completed");
        assert_eq!(exec.sent_count, 3);
        assert_eq!(exec.failed_count, 0);
        assert_eq!(exec.current_index, exec.sent_count + exec.failed_count);
        assert!(exec.completed_at.is_some());

        let rows = fx
            .store
            .list_broadcast_messages(&started.execution_id)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| r.status == "sent"));

        // Personalized bodies went to normalized chat ids.
        let sent = fx.client.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0, "6591234560@c.us");
        assert_eq!(sent[0].1, "Hi Contact 0, rates attached.");

        // Two inter-contact gaps of at least 60s each elapsed on the
        // (virtual) clock.
        assert!(fx.clock.total_slept() >= Duration::from_secs(120));

        // Progress events increase monotonically to a terminal status.
        let mut progresses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let GatewayEvent::BroadcastStatus {
                progress, status, ..
            } = event
            {
                progresses.push((progress, status));
            }
        }
        assert!(progresses.len() >= 4);
        assert!(progresses.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(progresses.last().unwrap().1, "completed");
    }

    #[tokio::test]
    async fn failed_contact_does_not_stop_the_campaign() {
        let fx = fixture().await;
        // Second send fails terminally.
        fx.client
            .fail_targets
            .lock()
            .unwrap()
            .push("6591234561@c.us".into());

        let started = fx
            .manager
            .start(BroadcastInput {
                contacts: contacts(3),
                message: "Hello {name}".into(),
                image_url: None,
                delay_mode: "2-3min".into(),
                notification_contact: Some("98765432".into()),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exec = fx
            .store
            .get_broadcast_execution(&started.execution_id)
            .await
            .unwrap();
        assert_eq!(exec.status, "completed");
        assert_eq!(exec.sent_count, 2);
        assert_eq!(exec.failed_count, 1);
        assert_eq!(exec.current_index, 3);

        let rows = fx
            .store
            .list_broadcast_messages(&started.execution_id)
            .await
            .unwrap();
        assert_eq!(rows[1].status, "failed");
        assert!(rows[1].error.is_some());

        // Summary went to the notification contact at the end.
        let sent = fx.client.sent.lock().unwrap().clone();
        let summary = sent.last().unwrap();
        assert_eq!(summary.0, "6598765432@c.us");
        assert!(summary.1.contains("2 sent, 1 failed of 3"));
        assert!(summary.1.contains("Last successful recipient: Contact 2"));
    }

    #[tokio::test]
    async fn cancellation_persists_progress() {
        let fx = fixture().await;
        let started = fx
            .manager
            .start(BroadcastInput {
                contacts: contacts(3),
                message: "Hello {name}".into(),
                image_url: None,
                delay_mode: "1-2min".into(),
                notification_contact: None,
            })
            .await
            .unwrap();

        // Cancel before the runner gets its first poll.
        assert!(fx.manager.cancel(&started.execution_id));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let exec = fx
            .store
            .get_broadcast_execution(&started.execution_id)
            .await
            .unwrap();
        assert_eq!(exec.status, "cancelled");
        assert_eq!(exec.sent_count, 0);
        assert!(fx.client.sent.lock().unwrap().is_empty());

        // Cancelling an unknown execution reports false.
        assert!(!fx.manager.cancel("nope"));
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let fx = fixture().await;
        let empty = fx
            .manager
            .start(BroadcastInput {
                contacts: vec![],
                message: "hi".into(),
                image_url: None,
                delay_mode: "1-2min".into(),
                notification_contact: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(empty, GatewayError::Validation(_)));

        let bad_mode = fx
            .manager
            .start(BroadcastInput {
                contacts: contacts(1),
                message: "hi".into(),
                image_url: None,
                delay_mode: "instant".into(),
                notification_contact: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(bad_mode, GatewayError::Validation(_)));
    }
}
