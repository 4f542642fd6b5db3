//! WebSocket fanout for the dashboard.
//!
//! Server-push only. Each connection gets `{type:"connected"}`, then the
//! current QR code if one is pending, then live bus events. Slow
//! consumers skip events rather than back-pressuring the bus.

use crate::gateway::Gateway;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use wagate_core::shellexpand;

/// The dashboard and the event feed share the server root: a WebSocket
/// upgrade gets the feed, a plain GET gets the dashboard page.
pub async fn root_or_ws(State(gw): State<Arc<Gateway>>, req: Request) -> Response {
    if req.headers().contains_key(header::UPGRADE) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade
                .on_upgrade(move |socket| handle_socket(socket, gw))
                .into_response(),
            Err(rejection) => rejection.into_response(),
        };
    }
    serve_index(&gw).await
}

async fn serve_index(gw: &Arc<Gateway>) -> Response {
    let index = format!(
        "{}/public/index.html",
        shellexpand(&gw.cfg.gateway.data_dir)
    );
    match tokio::fs::read_to_string(&index).await {
        Ok(html) => Html(html).into_response(),
        Err(_) => Html(
            "<!doctype html><title>wagate</title><p>wagate gateway is running. \
             No dashboard is installed.</p>"
                .to_string(),
        )
        .into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, gw: Arc<Gateway>) {
    let mut rx = gw.bus.subscribe();

    let hello = json!({ "type": "connected" });
    if socket
        .send(WsMessage::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    // Late joiners still need the pending QR code.
    let snap = gw.supervisor.qr_snapshot();
    if let Some(qr) = snap.qr {
        let replay = json!({
            "type": "qr",
            "qr_png_dataurl": qr,
            "generated_at": snap.generated_at.map(|at| at.to_rfc3339()),
        });
        if socket
            .send(WsMessage::Text(replay.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("event serialization failed: {e}");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("ws consumer lagged, {skipped} events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
