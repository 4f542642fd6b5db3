//! Priority send queue.
//!
//! Serializes every outbound send against the single client: four FIFO
//! bands (critical > high > normal > low) drained by one worker with
//! retry, readiness waiting, and human-like inter-send spacing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;
use wagate_behavior::HumanBehavior;
use wagate_core::clock::Clock;
use wagate_core::message::{MediaPayload, SendPriority, SendReceipt};
use wagate_core::traits::{ClientState, WhatsAppClient};
use wagate_core::GatewayError;

/// Give up after this many attempts per request.
const MAX_ATTEMPTS: u32 = 5;
/// Cap on the exponential backoff between attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Minimum backoff after a provider-side rate limit.
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(5);
/// How long one attempt waits for the client to become ready.
const READY_WAIT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(500);

/// One outbound send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub target_chat_id: String,
    pub text: Option<String>,
    pub media: Option<MediaPayload>,
    pub priority: SendPriority,
}

impl SendRequest {
    pub fn text(target: impl Into<String>, text: impl Into<String>, priority: SendPriority) -> Self {
        Self {
            target_chat_id: target.into(),
            text: Some(text.into()),
            media: None,
            priority,
        }
    }
}

/// Cancels a queued request; a cancelled request still in its band is
/// discarded without a send.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct QueuedSend {
    request: SendRequest,
    resolver: oneshot::Sender<Result<SendReceipt, GatewayError>>,
    cancel: CancelToken,
}

/// Handle to an enqueued send.
pub struct PendingSend {
    rx: oneshot::Receiver<Result<SendReceipt, GatewayError>>,
    pub cancel: CancelToken,
}

impl PendingSend {
    /// Wait for the terminal outcome of this send.
    pub async fn outcome(self) -> Result<SendReceipt, GatewayError> {
        match self.rx.await {
            Ok(result) => result,
            // Worker dropped the resolver: shutdown.
            Err(_) => Err(GatewayError::Shutdown),
        }
    }
}

pub struct SendQueue {
    bands: Mutex<[VecDeque<QueuedSend>; 4]>,
    notify: Notify,
    client: Arc<dyn WhatsAppClient>,
    behavior: Arc<HumanBehavior>,
    clock: Arc<dyn Clock>,
    draining: AtomicBool,
}

impl SendQueue {
    pub fn new(
        client: Arc<dyn WhatsAppClient>,
        behavior: Arc<HumanBehavior>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bands: Mutex::new([
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ]),
            notify: Notify::new(),
            client,
            behavior,
            clock,
            draining: AtomicBool::new(false),
        })
    }

    /// Queue a request. The returned handle resolves when the send
    /// terminally succeeds or fails.
    pub fn enqueue(&self, request: SendRequest) -> PendingSend {
        let (tx, rx) = oneshot::channel();
        let cancel = CancelToken::new();
        let band = request.priority.band();
        let queued = QueuedSend {
            request,
            resolver: tx,
            cancel: cancel.clone(),
        };
        {
            let mut bands = self.bands.lock().unwrap();
            bands[band].push_back(queued);
        }
        self.notify.notify_one();
        PendingSend { rx, cancel }
    }

    /// Enqueue and await in one step.
    pub async fn send(&self, request: SendRequest) -> Result<SendReceipt, GatewayError> {
        self.enqueue(request).outcome().await
    }

    /// Number of queued requests across all bands.
    pub fn depth(&self) -> usize {
        self.bands.lock().unwrap().iter().map(|b| b.len()).sum()
    }

    /// Begin draining: the worker exits once the bands are empty.
    pub fn start_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Spawn the single worker task.
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.worker_loop().await })
    }

    async fn worker_loop(&self) {
        loop {
            let next = {
                let mut bands = self.bands.lock().unwrap();
                bands.iter_mut().find_map(|band| band.pop_front())
            };

            let Some(queued) = next else {
                if self.draining.load(Ordering::SeqCst) {
                    debug!("send queue drained, worker exiting");
                    return;
                }
                self.notify.notified().await;
                continue;
            };

            if queued.cancel.is_cancelled() {
                let _ = queued.resolver.send(Err(GatewayError::Shutdown));
                continue;
            }

            let priority = queued.request.priority;
            let result = self.attempt_until_terminal(&queued.request).await;
            let succeeded = result.is_ok();

            if succeeded && priority != SendPriority::Critical {
                // Successful sends count against the human-behavior budget;
                // the token is synthetic since outbound messages have no
                // inbound id. Critical sends bypass rate accounting the
                // same way they bypass admission.
                self.behavior
                    .record_processed(&format!("sent_{}", Uuid::new_v4().simple()));
            }

            let _ = queued.resolver.send(result);

            if succeeded {
                let spacing = if priority.is_expedited() {
                    self.clock.uniform(Duration::ZERO, Duration::from_millis(400))
                } else {
                    self.clock
                        .uniform(Duration::from_millis(800), Duration::from_millis(1800))
                };
                self.clock.sleep(spacing).await;
            }
        }
    }

    /// Run the per-attempt protocol until success or a terminal failure.
    async fn attempt_until_terminal(
        &self,
        request: &SendRequest,
    ) -> Result<SendReceipt, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self.attempt_once(request).await;
            match result {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = self.backoff_for(attempt, &err);
                    warn!(
                        "send to {} failed (attempt {}/{MAX_ATTEMPTS}): {err}; retrying in {backoff:?}",
                        request.target_chat_id,
                        attempt + 1,
                    );
                    self.clock.sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        "send to {} failed terminally after {} attempt(s): {err}",
                        request.target_chat_id,
                        attempt + 1
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_once(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
        self.wait_ready().await?;

        match (&request.media, &request.text) {
            (Some(media), _) => self.client.send_media(&request.target_chat_id, media).await,
            (None, Some(text)) => self.client.send_text(&request.target_chat_id, text).await,
            (None, None) => Err(GatewayError::Validation(
                "send request has neither text nor media".into(),
            )),
        }
    }

    /// Wait up to 30s for the client to report connected.
    async fn wait_ready(&self) -> Result<(), GatewayError> {
        let mut waited = Duration::ZERO;
        loop {
            if self.client.state().await == ClientState::Connected {
                return Ok(());
            }
            if waited >= READY_WAIT {
                return Err(GatewayError::TransientClient(
                    "client not ready within 30s".into(),
                ));
            }
            self.clock.sleep(READY_POLL).await;
            waited += READY_POLL;
        }
    }

    /// `min(2^attempt · 500ms, 30s) + U(0, 500ms)`, floored at 5s after a
    /// provider rate limit.
    fn backoff_for(&self, attempt: u32, err: &GatewayError) -> Duration {
        let exp = Duration::from_millis(500u64.saturating_mul(1u64 << attempt.min(16)));
        let mut backoff = exp.min(BACKOFF_CAP)
            + self.clock.uniform(Duration::ZERO, Duration::from_millis(500));
        if matches!(err, GatewayError::RateLimited(_)) && backoff < RATE_LIMIT_FLOOR {
            backoff = RATE_LIMIT_FLOOR;
        }
        backoff
    }
}
