//! Broadcast control endpoints: trigger, status, history, cancel.

use super::{ok, ApiResult};
use crate::gateway::broadcast::{BroadcastContact, BroadcastInput};
use crate::gateway::Gateway;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/api/broadcast/interest-rate", post(start_broadcast))
        .route("/api/broadcast/status/{id}", get(broadcast_status))
        .route("/api/broadcast/history", get(broadcast_history))
        .route("/api/broadcast/cancel/{id}", post(cancel_broadcast))
}

#[derive(Deserialize)]
struct StartBody {
    contacts: Vec<BroadcastContact>,
    message: String,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default = "default_delay_mode")]
    delay_mode: String,
    #[serde(default)]
    notification_contact: Option<String>,
}

fn default_delay_mode() -> String {
    "1-2min".to_string()
}

async fn start_broadcast(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<StartBody>,
) -> ApiResult {
    let started = gw
        .broadcasts
        .start(BroadcastInput {
            contacts: body.contacts,
            message: body.message,
            image_url: body.image_url,
            delay_mode: body.delay_mode,
            notification_contact: body.notification_contact,
        })
        .await?;
    Ok(ok(started))
}

/// Accepts either the execution id or the public `broadcast_*` id.
async fn broadcast_status(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    let execution = gw.store.resolve_broadcast(&id).await?;
    let messages = gw.store.list_broadcast_messages(&execution.id).await?;
    let progress = if execution.total_contacts > 0 {
        execution.current_index as f64 / execution.total_contacts as f64
    } else {
        0.0
    };
    let summary = json!({
        "status": execution.status,
        "total": execution.total_contacts,
        "sent": execution.sent_count,
        "failed": execution.failed_count,
        "progress": progress,
    });
    Ok(ok(json!({
        "execution": execution,
        "messages": messages,
        "summary": summary,
    })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
    status: Option<String>,
}

fn default_history_limit() -> i64 {
    20
}

async fn broadcast_history(
    State(gw): State<Arc<Gateway>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let limit = query.limit.clamp(1, 200);
    Ok(ok(gw
        .store
        .list_broadcast_history(query.status.as_deref(), limit)
        .await?))
}

async fn cancel_broadcast(State(gw): State<Arc<Gateway>>, Path(id): Path<String>) -> ApiResult {
    let execution = gw.store.resolve_broadcast(&id).await?;
    let cancelled = gw.broadcasts.cancel(&execution.id);
    Ok(ok(json!({
        "execution_id": execution.id,
        "cancelled": cancelled,
    })))
}
