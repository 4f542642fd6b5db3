//! Receive queue and classifier dispatch loop.
//!
//! Ingests raw inbound messages, drops non-group chats and duplicates,
//! classifies against the trigger set, and schedules each survivor for
//! dispatch after a randomized read delay.

use crate::engine::{Engine, HandlerPayload};
use crate::gateway::sendq::{SendQueue, SendRequest};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use wagate_behavior::{Admission, HumanBehavior, RejectReason};
use wagate_core::classify::{classify, Classification};
use wagate_core::clock::Clock;
use wagate_core::message::{InboundMessage, SendPriority};

/// A message waiting out its read delay.
struct QueuedInbound {
    release_at: chrono::DateTime<chrono::Utc>,
    seq: u64,
    msg: InboundMessage,
    classification: Classification,
}

impl PartialEq for QueuedInbound {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedInbound {}
impl PartialOrd for QueuedInbound {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedInbound {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.release_at
            .cmp(&other.release_at)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct ReceiveQueue {
    heap: Mutex<BinaryHeap<Reverse<QueuedInbound>>>,
    notify: Notify,
    behavior: Arc<HumanBehavior>,
    clock: Arc<dyn Clock>,
    engine: Arc<Engine>,
    sendq: Arc<SendQueue>,
    seq: AtomicU64,
}

impl ReceiveQueue {
    pub fn new(
        behavior: Arc<HumanBehavior>,
        clock: Arc<dyn Clock>,
        engine: Arc<Engine>,
        sendq: Arc<SendQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            behavior,
            clock,
            engine,
            sendq,
            seq: AtomicU64::new(0),
        })
    }

    /// Admit a raw inbound message. Non-group chats, duplicates, and
    /// trigger misses are dropped here; everything else is scheduled for
    /// `now + read_delay`.
    pub fn ingest(&self, msg: InboundMessage) {
        if !msg.is_group() {
            debug!("ignoring non-group message from {}", msg.chat_id);
            return;
        }
        if self.behavior.was_processed(&msg.wa_message_id) {
            debug!("duplicate message {} dropped", msg.wa_message_id);
            return;
        }

        let classification = classify(&msg.body, msg.quoted_id.is_some());
        if classification == Classification::Ignored {
            debug!("message {} matched no trigger", msg.wa_message_id);
            return;
        }

        let delay = self.behavior.read_delay();
        let release_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let item = QueuedInbound {
            release_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            msg,
            classification,
        };
        self.heap.lock().unwrap().push(Reverse(item));
        self.notify.notify_one();
    }

    /// Spawn the single dispatch worker.
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.worker_loop().await })
    }

    async fn worker_loop(&self) {
        loop {
            let due = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    None => Err(None),
                    Some(Reverse(head)) => {
                        let now = self.clock.now();
                        if head.release_at <= now {
                            Ok(heap.pop().map(|Reverse(item)| item))
                        } else {
                            Err(Some(head.release_at - now))
                        }
                    }
                }
            };

            match due {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => {}
                Err(None) => self.notify.notified().await,
                Err(Some(until)) => {
                    let wait = until.to_std().unwrap_or(Duration::ZERO);
                    // A newly ingested message with an earlier release
                    // interrupts the wait.
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn process(&self, item: QueuedInbound) {
        let msg = &item.msg;

        // A duplicate may have been delivered while this one was queued.
        if self.behavior.was_processed(&msg.wa_message_id) {
            debug!("duplicate message {} dropped at release", msg.wa_message_id);
            return;
        }

        self.behavior.maybe_network_hiccup().await;

        loop {
            match self.behavior.try_admit() {
                Admission::Admit => break,
                Admission::Reject(RejectReason::Cooldown) => {
                    self.clock.sleep(self.behavior.cooldown()).await;
                }
                Admission::Reject(reason) => {
                    self.notify_limit(msg, reason);
                    info!(
                        "message {} dropped: {}",
                        msg.wa_message_id,
                        reason.as_str()
                    );
                    return;
                }
            }
        }

        // Occasionally "double-check" the message before responding.
        if self.clock.chance(0.1) {
            let extra = self
                .clock
                .uniform(Duration::from_secs(1), Duration::from_secs(3));
            self.clock.sleep(extra).await;
        }

        self.clock.sleep(self.behavior.response_delay()).await;

        let payload = HandlerPayload {
            msg: msg.clone(),
            classification: item.classification,
        };
        if let Err(e) = self.engine.dispatch(payload).await {
            warn!("dispatch of {} failed: {e}", msg.wa_message_id);
        }

        // Processed either way: handler failures must not cause redelivery.
        self.behavior.record_processed(&msg.wa_message_id);
    }

    /// Post the once-per-window rate-limit notice back to the group.
    ///
    /// Group chats only; the notice goes out at critical priority so it
    /// bypasses the very limits it reports. Fire-and-forget.
    fn notify_limit(&self, msg: &InboundMessage, reason: RejectReason) {
        if !self.behavior.take_limit_notice(reason) {
            return;
        }
        let text = match reason {
            RejectReason::HourlyLimit => {
                "We've reached our hourly message limit. \
                 Your message was received and we'll resume replying shortly."
            }
            RejectReason::DailyLimit => {
                "We've reached our daily message limit. \
                 Your message was received and we'll resume replying tomorrow."
            }
            RejectReason::Cooldown => return,
        };
        // Detached: the worker must not wait on the send outcome.
        let _pending = self.sendq.enqueue(SendRequest::text(
            &msg.chat_id,
            text,
            SendPriority::Critical,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::engine::{Handler, HandlerCtx};
    use crate::gateway::sendq::tests_support::{ready_queue_with, AlwaysOkClient};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use wagate_core::clock::testing::FakeClock;
    use wagate_core::config::BehaviorConfig;
    use wagate_core::GatewayError;
    use wagate_store::Store;

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(
            &self,
            _ctx: &HandlerCtx,
            _payload: &HandlerPayload,
        ) -> Result<(), GatewayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        queue: Arc<ReceiveQueue>,
        behavior: Arc<HumanBehavior>,
        client: Arc<AlwaysOkClient>,
        handler: Arc<CountingHandler>,
        clock: Arc<FakeClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FakeClock::at(Utc::now()));
        let behavior = Arc::new(HumanBehavior::new(BehaviorConfig::default(), clock.clone()));
        let (sendq, client) = ready_queue_with(behavior.clone(), clock.clone());

        let store = Store::in_memory().await.unwrap();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let mut engine = Engine::new(HandlerCtx {
            sendq: sendq.clone(),
            store,
            bus: EventBus::new(16),
            clock: clock.clone(),
        });
        engine.register("bank_rates_update", handler.clone());
        engine.ensure_workflows().await.unwrap();
        let engine = Arc::new(engine);

        let queue = ReceiveQueue::new(behavior.clone(), clock.clone(), engine, sendq);
        queue.spawn_worker();
        Fixture {
            queue,
            behavior,
            client,
            handler,
            clock,
        }
    }

    fn trigger_msg(id: &str, chat_id: &str) -> InboundMessage {
        InboundMessage {
            wa_message_id: id.into(),
            chat_id: chat_id.into(),
            sender_id: "6591112222".into(),
            body: "please update bank rates".into(),
            timestamp: Utc::now(),
            quoted_id: None,
            quoted_body: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn dispatches_group_trigger_messages() {
        let fx = fixture().await;
        fx.queue.ingest(trigger_msg("m1", "G@g.us"));
        settle().await;
        assert_eq!(fx.handler.0.load(Ordering::SeqCst), 1);
        assert!(fx.behavior.was_processed("m1"));
    }

    #[tokio::test]
    async fn non_group_chats_never_dispatch_or_send() {
        let fx = fixture().await;
        fx.queue.ingest(trigger_msg("m1", "6591112222@c.us"));
        settle().await;
        assert_eq!(fx.handler.0.load(Ordering::SeqCst), 0);
        assert!(fx.client.sent.lock().unwrap().is_empty());
        assert!(!fx.behavior.was_processed("m1"));
    }

    #[tokio::test]
    async fn unmatched_bodies_are_dropped_without_accounting() {
        let fx = fixture().await;
        let mut msg = trigger_msg("m1", "G@g.us");
        msg.body = "nothing interesting".into();
        fx.queue.ingest(msg);
        settle().await;
        assert_eq!(fx.handler.0.load(Ordering::SeqCst), 0);
        assert_eq!(fx.behavior.snapshot().hourly_count, 0);
    }

    #[tokio::test]
    async fn same_message_id_dispatches_once() {
        let fx = fixture().await;
        fx.queue.ingest(trigger_msg("m1", "G@g.us"));
        settle().await;
        fx.queue.ingest(trigger_msg("m1", "G@g.us"));
        settle().await;
        assert_eq!(fx.handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hourly_limit_posts_one_critical_notice_and_drops() {
        let fx = fixture().await;
        // Exhaust the hourly budget.
        for i in 0..80 {
            fx.behavior.record_processed(&format!("pre{i}"));
            fx.clock.advance(Duration::from_millis(300));
        }
        let count_before = fx.behavior.snapshot().hourly_count;

        fx.queue.ingest(trigger_msg("m1", "G@g.us"));
        settle().await;

        // No dispatch, exactly one notice to the originating group,
        // counters untouched (critical sends bypass accounting).
        assert_eq!(fx.handler.0.load(Ordering::SeqCst), 0);
        let sent = fx.client.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "G@g.us");
        assert!(sent[0].1.contains("hourly message limit"));
        assert_eq!(fx.behavior.snapshot().hourly_count, count_before);

        // A second rejected message in the same window posts no new notice.
        fx.queue.ingest(trigger_msg("m2", "G@g.us"));
        settle().await;
        assert_eq!(fx.client.sent.lock().unwrap().len(), 1);
    }
}
