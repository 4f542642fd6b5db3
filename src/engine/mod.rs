//! Workflow engine: resolves a classification to a named handler,
//! invokes it with a context, and records an execution row around the call.

pub mod rates;
pub mod valuation;

use crate::bus::EventBus;
use crate::gateway::sendq::SendQueue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wagate_core::classify::Classification;
use wagate_core::clock::Clock;
use wagate_core::message::InboundMessage;
use wagate_core::GatewayError;
use wagate_store::Store;

/// What a handler receives.
#[derive(Debug, Clone)]
pub struct HandlerPayload {
    pub msg: InboundMessage,
    pub classification: Classification,
}

/// Capabilities exposed to handlers.
pub struct HandlerCtx {
    pub sendq: Arc<SendQueue>,
    pub store: Store,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
}

/// A named workflow handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerCtx, payload: &HandlerPayload)
        -> Result<(), GatewayError>;
}

/// Registry of handlers plus the execution-record bookkeeping.
pub struct Engine {
    ctx: HandlerCtx,
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
    /// Workflow row ids per handler name, resolved at startup.
    workflow_ids: tokio::sync::RwLock<HashMap<String, String>>,
}

impl Engine {
    pub fn new(ctx: HandlerCtx) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
            workflow_ids: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, name: &'static str, handler: Arc<dyn Handler>) {
        self.handlers.insert(name, handler);
    }

    /// Make sure every registered handler has a workflow row to attach
    /// executions to. Call once after registration.
    pub async fn ensure_workflows(&self) -> Result<(), GatewayError> {
        let mut ids = self.workflow_ids.write().await;
        for name in self.handlers.keys() {
            let workflow = self.ctx.store.ensure_workflow(name, "keyword").await?;
            ids.insert(name.to_string(), workflow.id);
        }
        info!("workflow registry ready ({} handlers)", self.handlers.len());
        Ok(())
    }

    /// Dispatch a classified message to its handler.
    ///
    /// Handler failures are folded into the execution record; the caller
    /// treats dispatch as fire-and-forget either way.
    pub async fn dispatch(&self, payload: HandlerPayload) -> Result<(), GatewayError> {
        let Some(name) = payload.classification.handler_name() else {
            return Ok(());
        };
        let Some(handler) = self.handlers.get(name) else {
            warn!("no handler registered for '{name}'");
            return Ok(());
        };

        // Respect the dashboard's active toggle.
        if let Ok(Some(workflow)) = self.ctx.store.get_workflow_by_name(name).await {
            if !workflow.is_active {
                debug!("workflow '{name}' is inactive, skipping");
                return Ok(());
            }
        }

        let workflow_id = {
            let ids = self.workflow_ids.read().await;
            ids.get(name).cloned()
        };
        let workflow_id = match workflow_id {
            Some(id) => id,
            None => self.ctx.store.ensure_workflow(name, "keyword").await?.id,
        };

        let trigger_payload = serde_json::to_string(&payload.msg)?;
        let execution_id = self
            .ctx
            .store
            .begin_execution(&workflow_id, &trigger_payload)
            .await?;

        match handler.handle(&self.ctx, &payload).await {
            Ok(()) => {
                self.ctx
                    .store
                    .finish_execution(&execution_id, "completed", None)
                    .await?;
                Ok(())
            }
            Err(err) => {
                // A reply that quotes nothing we forwarded is routine, not
                // an incident.
                match &err {
                    GatewayError::NotFound(what) => {
                        debug!("workflow '{name}' ended without effect: {what}")
                    }
                    other => warn!("workflow '{name}' failed: {other}"),
                }
                self.ctx
                    .store
                    .finish_execution(&execution_id, "failed", Some(&err.to_string()))
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sendq::tests_support::ready_queue;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wagate_core::classify::classify;
    use wagate_core::clock::SystemClock;

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(
            &self,
            _ctx: &HandlerCtx,
            _payload: &HandlerPayload,
        ) -> Result<(), GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GatewayError::Validation("missing fields".into()))
            } else {
                Ok(())
            }
        }
    }

    fn message(body: &str) -> InboundMessage {
        InboundMessage {
            wa_message_id: "m1".into(),
            chat_id: "R@g.us".into(),
            sender_id: "6591234567".into(),
            body: body.into(),
            timestamp: Utc::now(),
            quoted_id: None,
            quoted_body: None,
        }
    }

    async fn engine_with(handler: Arc<CountingHandler>) -> Engine {
        let store = Store::in_memory().await.unwrap();
        let ctx = HandlerCtx {
            sendq: ready_queue(),
            store,
            bus: EventBus::new(16),
            clock: Arc::new(SystemClock),
        };
        let mut engine = Engine::new(ctx);
        engine.register("bank_rates_update", handler);
        engine.ensure_workflows().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn dispatch_records_completed_execution() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let engine = engine_with(handler.clone()).await;

        let msg = message("please update bank rates");
        let classification = classify(&msg.body, false);
        engine
            .dispatch(HandlerPayload {
                msg,
                classification,
            })
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let execs = engine.ctx.store.list_executions(None, 10).await.unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].status, "completed");
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_execution() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let engine = engine_with(handler.clone()).await;

        let msg = message("update bank rates");
        engine
            .dispatch(HandlerPayload {
                classification: classify(&msg.body, false),
                msg,
            })
            .await
            .unwrap();

        let execs = engine.ctx.store.list_executions(None, 10).await.unwrap();
        assert_eq!(execs[0].status, "failed");
        assert!(execs[0].error.as_deref().unwrap().contains("missing fields"));
    }

    #[tokio::test]
    async fn inactive_workflow_is_skipped() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let engine = engine_with(handler.clone()).await;

        let workflow = engine
            .ctx
            .store
            .get_workflow_by_name("bank_rates_update")
            .await
            .unwrap()
            .unwrap();
        engine
            .ctx
            .store
            .toggle_workflow(&workflow.id, false)
            .await
            .unwrap();

        let msg = message("update bank rates");
        engine
            .dispatch(HandlerPayload {
                classification: classify(&msg.body, false),
                msg,
            })
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(engine.ctx.store.list_executions(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignored_classification_is_a_no_op() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let engine = engine_with(handler.clone()).await;

        let msg = message("lunch anyone?");
        engine
            .dispatch(HandlerPayload {
                classification: classify(&msg.body, false),
                msg,
            })
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
