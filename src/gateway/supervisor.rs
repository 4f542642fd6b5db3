//! Session supervisor: owns the WhatsApp client lifecycle.
//!
//! Renders QR codes for the dashboard, reconnects with jittered
//! exponential backoff, wipes broken sessions after auth failures, and
//! runs the watchdog and memory-monitor loops that recycle a wedged
//! client.

use crate::bus::{EventBus, GatewayEvent};
use crate::gateway::receive::ReceiveQueue;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use wagate_core::clock::Clock;
use wagate_core::shellexpand;
use wagate_core::traits::{ClientEvent, ClientState, WhatsAppClient};
use wagate_core::GatewayError;

/// QR codes older than this are flagged stale for the dashboard.
const QR_STALE_SECS: i64 = 25;
/// RSS above this logs a warning.
const MEMORY_SOFT_MB: u64 = 350;
/// RSS above this recycles the client.
const MEMORY_HARD_MB: u64 = 450;

/// Where the session sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    None,
    Starting,
    Qr,
    Authenticated,
    Ready,
    Disconnected,
    Failed,
}

/// Dashboard view of the QR / auth state.
#[derive(Debug, Clone, Serialize)]
pub struct QrSnapshot {
    pub qr: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub authenticated: bool,
    pub state: SessionState,
}

/// Per-step outcome of a logout request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutReport {
    pub client_logout: bool,
    pub client_destroy: bool,
    pub chrome_profile_cleanup: bool,
    pub local_session_cleanup: bool,
    pub qr_code_cleared: bool,
}

struct StatusInner {
    state: SessionState,
    qr_png: Option<String>,
    qr_generated_at: Option<DateTime<Utc>>,
    last_qr_raw: Option<String>,
}

pub struct Supervisor {
    client: Arc<dyn WhatsAppClient>,
    receive: Arc<ReceiveQueue>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    data_dir: String,
    status: Mutex<StatusInner>,
    reconnect_attempts: AtomicU32,
}

impl Supervisor {
    pub fn new(
        client: Arc<dyn WhatsAppClient>,
        receive: Arc<ReceiveQueue>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        data_dir: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            receive,
            bus,
            clock,
            data_dir: shellexpand(data_dir),
            status: Mutex::new(StatusInner {
                state: SessionState::None,
                qr_png: None,
                qr_generated_at: None,
                last_qr_raw: None,
            }),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().unwrap().state
    }

    pub fn qr_snapshot(&self) -> QrSnapshot {
        let status = self.status.lock().unwrap();
        let now = self.clock.now();
        let is_stale = status
            .qr_generated_at
            .map(|at| (now - at).num_seconds() > QR_STALE_SECS)
            .unwrap_or(false);
        QrSnapshot {
            qr: status.qr_png.clone(),
            generated_at: status.qr_generated_at,
            is_stale,
            authenticated: matches!(
                status.state,
                SessionState::Authenticated | SessionState::Ready
            ),
            state: status.state,
        }
    }

    /// Kick off the client session in the background. No-op when a
    /// session is already starting or live.
    pub fn start(self: &Arc<Self>) {
        {
            let mut status = self.status.lock().unwrap();
            if matches!(
                status.state,
                SessionState::Starting
                    | SessionState::Qr
                    | SessionState::Authenticated
                    | SessionState::Ready
            ) {
                debug!("supervisor start ignored in state {:?}", status.state);
                return;
            }
            status.state = SessionState::Starting;
        }

        let sup = self.clone();
        tokio::spawn(async move { sup.run_session().await });
    }

    async fn run_session(self: Arc<Self>) {
        info!("starting WhatsApp client session");
        let mut rx = match self.client.start().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("client initialization failed: {e}");
                self.on_disconnect(&e.to_string()).await;
                return;
            }
        };

        loop {
            match rx.recv().await {
                Some(ClientEvent::Qr(raw)) => self.on_qr(&raw),
                Some(ClientEvent::Authenticated) => {
                    self.set_state(SessionState::Authenticated);
                    self.bus.publish(GatewayEvent::Authenticated {});
                }
                Some(ClientEvent::Ready) => self.on_ready(),
                Some(ClientEvent::AuthFailure(reason)) => {
                    self.on_auth_failure(&reason).await;
                    return;
                }
                Some(ClientEvent::Disconnected(reason)) => {
                    self.on_disconnect(&reason).await;
                    return;
                }
                Some(ClientEvent::Message(msg)) => self.receive.ingest(msg),
                None => {
                    self.on_disconnect("event stream closed").await;
                    return;
                }
            }
        }
    }

    /// Render and publish a QR code, once per unique raw payload.
    fn on_qr(&self, raw: &str) {
        let png = {
            let mut status = self.status.lock().unwrap();
            if status.last_qr_raw.as_deref() == Some(raw) {
                return;
            }
            let png = match qr_png_dataurl(raw) {
                Ok(png) => png,
                Err(e) => {
                    warn!("QR render failed: {e}");
                    return;
                }
            };
            status.last_qr_raw = Some(raw.to_string());
            status.qr_png = Some(png.clone());
            status.qr_generated_at = Some(self.clock.now());
            status.state = SessionState::Qr;
            png
        };

        info!("QR code generated, waiting for scan");
        self.bus.publish(GatewayEvent::Qr {
            qr_png_dataurl: png,
            generated_at: self.clock.now().to_rfc3339(),
        });
    }

    fn on_ready(&self) {
        {
            let mut status = self.status.lock().unwrap();
            status.state = SessionState::Ready;
            status.qr_png = None;
            status.qr_generated_at = None;
            status.last_qr_raw = None;
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        info!("WhatsApp client ready");
        self.bus.publish(GatewayEvent::Ready {});
        self.bus.log("info", "WhatsApp client ready");
    }

    async fn on_auth_failure(self: &Arc<Self>, reason: &str) {
        warn!("authentication failed: {reason}; wiping local session");
        self.set_state(SessionState::Failed);
        let _ = self.client.destroy().await;

        let session_dir = format!("{}/session", self.data_dir);
        if let Err(e) = remove_dir_if_present(&session_dir) {
            warn!("failed to wipe session dir: {e}");
        }

        let delay = self
            .clock
            .uniform(Duration::from_secs(8), Duration::from_secs(15));
        self.schedule_start(delay);
    }

    async fn on_disconnect(self: &Arc<Self>, reason: &str) {
        warn!("client disconnected: {reason}");
        self.set_state(SessionState::Disconnected);
        let _ = self.client.destroy().await;

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let base = Duration::from_secs(1u64 << attempt.min(6)).min(Duration::from_secs(60));
        let delay = base + self.clock.uniform(Duration::ZERO, Duration::from_secs(10));
        info!("reconnecting in {delay:?} (attempt {})", attempt + 1);
        self.bus
            .log("warn", format!("WhatsApp disconnected: {reason}; reconnecting"));
        self.schedule_start(delay);
    }

    fn schedule_start(self: &Arc<Self>, delay: Duration) {
        let sup = self.clone();
        tokio::spawn(async move {
            sup.clock.sleep(delay).await;
            sup.start();
        });
    }

    /// Full logout: invalidate the remote session and purge local state.
    /// Each step's success is reported independently; a fresh session is
    /// scheduled afterwards either way.
    pub async fn logout(self: &Arc<Self>) -> LogoutReport {
        info!("logout requested");
        let client_logout = self.client.logout().await.is_ok();
        let client_destroy = self.client.destroy().await.is_ok();

        let local_session_cleanup =
            remove_dir_if_present(&format!("{}/session", self.data_dir)).is_ok();
        let chrome_profile_cleanup =
            remove_dir_if_present(&format!("{}/chrome-profile", self.data_dir)).is_ok();

        {
            let mut status = self.status.lock().unwrap();
            status.qr_png = None;
            status.qr_generated_at = None;
            status.last_qr_raw = None;
            status.state = SessionState::None;
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.bus.publish(GatewayEvent::Logout {});

        self.schedule_start(Duration::from_secs(3));

        LogoutReport {
            client_logout,
            client_destroy,
            chrome_profile_cleanup,
            local_session_cleanup,
            qr_code_cleared: true,
        }
    }

    /// Watchdog: every 7–10 minutes, recycle the client unless it is
    /// connected or parked on a QR code awaiting a scan.
    pub fn spawn_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = sup
                    .clock
                    .uniform(Duration::from_secs(7 * 60), Duration::from_secs(10 * 60));
                sup.clock.sleep(interval).await;

                let client_state = sup.client.state().await;
                if client_state == ClientState::Connected {
                    continue;
                }
                if sup.status.lock().unwrap().qr_png.is_some() {
                    debug!("watchdog: QR pending, leaving client alone");
                    continue;
                }
                warn!("watchdog: client state {client_state:?}, recycling");
                let _ = sup.client.destroy().await;
                sup.set_state(SessionState::None);
                sup.start();
            }
        })
    }

    /// Memory monitor: every 6–8 minutes, check RSS and recycle the
    /// client past the hard threshold.
    pub fn spawn_memory_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.spawn_memory_monitor_with(resident_memory_mb)
    }

    /// The RSS reader is injectable so the loop can be driven in tests.
    fn spawn_memory_monitor_with<F>(self: &Arc<Self>, read_rss: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Option<u64> + Send + 'static,
    {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = sup
                    .clock
                    .uniform(Duration::from_secs(6 * 60), Duration::from_secs(8 * 60));
                sup.clock.sleep(interval).await;

                let Some(rss_mb) = read_rss() else {
                    continue;
                };
                if rss_mb > MEMORY_HARD_MB {
                    warn!("memory monitor: RSS {rss_mb}MB over hard limit, recycling client");
                    let _ = sup.client.destroy().await;
                    sup.set_state(SessionState::None);
                    sup.start();
                } else if rss_mb > MEMORY_SOFT_MB {
                    warn!("memory monitor: RSS {rss_mb}MB over soft limit");
                }
            }
        })
    }

    fn set_state(&self, state: SessionState) {
        self.status.lock().unwrap().state = state;
    }
}

/// Resident set size in MB, when the platform exposes it.
pub fn resident_memory_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096 / (1024 * 1024))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn remove_dir_if_present(path: &str) -> std::io::Result<()> {
    if std::path::Path::new(path).exists() {
        std::fs::remove_dir_all(path)
    } else {
        Ok(())
    }
}

/// Render a QR payload to a `data:image/png;base64,…` URL.
fn qr_png_dataurl(raw: &str) -> Result<String, GatewayError> {
    use image::{GrayImage, Luma};
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(raw.as_bytes(), EcLevel::L)
        .map_err(|e| GatewayError::TerminalClient(format!("QR generation failed: {e}")))?;

    // Pixels per module; scanners want a quiet zone of ~4 modules.
    const SCALE: u32 = 8;
    const QUIET_MODULES: u32 = 4;

    let modules = code.width() as u32;
    let side = (modules + 2 * QUIET_MODULES) * SCALE;
    let colors = code.to_colors();

    // White canvas, then stamp each dark module as a SCALE×SCALE block.
    let mut img = GrayImage::from_pixel(side, side, Luma([255u8]));
    for (i, color) in colors.iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let x0 = (i as u32 % modules + QUIET_MODULES) * SCALE;
        let y0 = (i as u32 / modules + QUIET_MODULES) * SCALE;
        for dy in 0..SCALE {
            for dx in 0..SCALE {
                img.put_pixel(x0 + dx, y0 + dy, Luma([0u8]));
            }
        }
    }

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::TerminalClient(format!("PNG encoding failed: {e}")))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(buf.into_inner());
    Ok(format!("data:image/png;base64,{encoded}"))
}
