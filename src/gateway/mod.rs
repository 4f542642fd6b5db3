//! Gateway — wires the message-plane components together and owns the
//! long-lived tasks: send worker, receive worker, session supervisor,
//! watchdog, memory monitor, self-ping, and the control-plane server.

pub mod broadcast;
pub mod receive;
pub mod sendq;
pub mod supervisor;

use crate::bus::EventBus;
use crate::engine::rates::RateUpdateHandler;
use crate::engine::valuation::{ValuationReplyHandler, ValuationRequestHandler};
use crate::engine::{Engine, HandlerCtx};
use broadcast::BroadcastManager;
use receive::ReceiveQueue;
use sendq::SendQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use supervisor::Supervisor;
use tracing::{info, warn};
use wagate_behavior::HumanBehavior;
use wagate_core::clock::Clock;
use wagate_core::config::Config;
use wagate_core::traits::WhatsAppClient;
use wagate_store::Store;

/// Time allowed for the send queue to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Gateway {
    pub cfg: Config,
    pub store: Store,
    pub bus: EventBus,
    pub behavior: Arc<HumanBehavior>,
    pub clock: Arc<dyn Clock>,
    pub client: Arc<dyn WhatsAppClient>,
    pub sendq: Arc<SendQueue>,
    pub receive: Arc<ReceiveQueue>,
    pub engine: Arc<Engine>,
    pub supervisor: Arc<Supervisor>,
    pub broadcasts: Arc<BroadcastManager>,
    pub started_at: Instant,
}

impl Gateway {
    /// Assemble every component around the given client and store.
    pub fn build(
        cfg: Config,
        store: Store,
        client: Arc<dyn WhatsAppClient>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let bus = EventBus::new(256);
        let behavior = Arc::new(HumanBehavior::new(cfg.behavior.clone(), clock.clone()));
        let sendq = SendQueue::new(client.clone(), behavior.clone(), clock.clone());

        let mut engine = Engine::new(HandlerCtx {
            sendq: sendq.clone(),
            store: store.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
        });
        engine.register("valuation_request", Arc::new(ValuationRequestHandler));
        engine.register("valuation_reply", Arc::new(ValuationReplyHandler));
        let webhook = cfg.webhooks.rate_update_url.clone();
        engine.register(
            "rate_package_update",
            Arc::new(RateUpdateHandler::new("rate_package_update", webhook.clone())),
        );
        engine.register(
            "bank_rates_update",
            Arc::new(RateUpdateHandler::new("bank_rates_update", webhook.clone())),
        );
        engine.register(
            "interest_rate",
            Arc::new(RateUpdateHandler::new("interest_rate", webhook)),
        );
        let engine = Arc::new(engine);

        let receive = ReceiveQueue::new(
            behavior.clone(),
            clock.clone(),
            engine.clone(),
            sendq.clone(),
        );
        let supervisor = Supervisor::new(
            client.clone(),
            receive.clone(),
            bus.clone(),
            clock.clone(),
            &cfg.gateway.data_dir,
        );
        let broadcasts = BroadcastManager::new(
            store.clone(),
            sendq.clone(),
            client.clone(),
            bus.clone(),
            clock.clone(),
        );

        Arc::new(Self {
            cfg,
            store,
            bus,
            behavior,
            clock,
            client,
            sendq,
            receive,
            engine,
            supervisor,
            broadcasts,
            started_at: Instant::now(),
        })
    }

    /// Run until a shutdown signal arrives, then drain and exit.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.engine.ensure_workflows().await?;

        let send_worker = self.sendq.spawn_worker();
        self.receive.spawn_worker();
        self.supervisor.spawn_watchdog();
        self.supervisor.spawn_memory_monitor();
        self.spawn_self_ping();

        // Client initialization must not block the control plane.
        self.supervisor.start();

        let server = tokio::spawn(crate::api::serve(self.clone()));

        info!(
            "wagate running | session: {} | port: {}",
            self.cfg.gateway.session_id, self.cfg.server.port
        );

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");

        // Stop accepting HTTP, abort campaigns, then give the send queue
        // a bounded window to flush what is already queued.
        server.abort();
        self.broadcasts.cancel_all_for_shutdown();
        self.sendq.start_drain();
        if tokio::time::timeout(DRAIN_TIMEOUT, send_worker).await.is_err() {
            warn!(
                "send queue did not drain within {DRAIN_TIMEOUT:?} ({} left)",
                self.sendq.depth()
            );
        }

        let _ = self.client.destroy().await;
        info!("shutdown complete");
        Ok(())
    }

    /// Periodically hit our own public health endpoint so free-tier hosts
    /// don't idle the process out.
    fn spawn_self_ping(self: &Arc<Self>) {
        let Some(app_url) = self.cfg.server.app_url.clone() else {
            return;
        };
        let clock = self.clock.clone();
        let url = format!("{}/health", app_url.trim_end_matches('/'));
        tokio::spawn(async move {
            let http = reqwest::Client::new();
            loop {
                let interval =
                    clock.uniform(Duration::from_secs(9 * 60), Duration::from_secs(11 * 60));
                clock.sleep(interval).await;
                match http.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!("self-ping returned {}", resp.status()),
                    Err(e) => warn!("self-ping failed: {e}"),
                }
            }
        });
    }
}
