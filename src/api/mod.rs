//! Control-plane HTTP server: REST endpoints for the dashboard plus the
//! WebSocket event feed. JSON in, JSON out, envelope `{success, data?,
//! error?}`.

mod admin;
mod broadcast;
mod upload;
mod ws;

use crate::gateway::Gateway;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use wagate_core::message::{MediaKind, MediaPayload, MediaSource, SendPriority};
use wagate_core::shellexpand;
use wagate_core::GatewayError;
use wagate_behavior::Admission;

use crate::gateway::sendq::SendRequest;

/// Error wrapper mapping the gateway taxonomy onto HTTP statuses.
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TransientClient(_) | GatewayError::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::TerminalClient(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Success envelope.
fn ok(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Assemble the control-plane router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let public_dir = format!("{}/public", shellexpand(&gateway.cfg.gateway.data_dir));

    Router::new()
        .route("/", get(ws::root_or_ws))
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/qr-code", get(qr_code))
        .route("/send-message", post(send_message))
        .route("/logout", post(logout))
        .merge(admin::routes())
        .merge(broadcast::routes())
        .merge(upload::routes())
        .fallback_service(ServeDir::new(public_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Build the router and serve until aborted.
pub async fn serve(gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let port = gateway.cfg.server.port;
    let app = router(gateway);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("control plane listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Liveness for orchestrators: always 200, even while the client is down.
async fn health(State(gw): State<Arc<Gateway>>) -> Json<Value> {
    let store = if gw.store.is_reachable().await {
        "CONNECTED"
    } else {
        "ERROR"
    };
    Json(json!({
        "status": "healthy",
        "server": "running",
        "whatsapp": { "state": gw.supervisor.state() },
        "store": store,
        "uptime": gw.started_at.elapsed().as_secs(),
        "memory": {
            "rss_mb": crate::gateway::supervisor::resident_memory_mb(),
        },
        "timestamp": gw.clock.now().to_rfc3339(),
    }))
}

async fn api_status(State(gw): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "sessionId": gw.cfg.gateway.session_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMinutes": gw.started_at.elapsed().as_secs() / 60,
        "humanBehavior": gw.behavior.snapshot(),
        "timestamp": gw.clock.now().to_rfc3339(),
    }))
}

async fn qr_code(State(gw): State<Arc<Gateway>>) -> Json<Value> {
    let snap = gw.supervisor.qr_snapshot();
    Json(json!({
        "qr": snap.qr,
        "generatedAt": snap.generated_at.map(|at| at.to_rfc3339()),
        "isStale": snap.is_stale,
        "authenticated": snap.authenticated,
        "state": snap.state,
        "timestamp": gw.clock.now().to_rfc3339(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    jid: Option<String>,
    group_id: Option<String>,
    message: Option<String>,
    image_url: Option<String>,
    priority: Option<String>,
}

async fn send_message(
    State(gw): State<Arc<Gateway>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let target = body
        .jid
        .or(body.group_id)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::Validation("jid or groupId is required".into()))?;

    if body.message.as_deref().unwrap_or("").is_empty() && body.image_url.is_none() {
        return Err(GatewayError::Validation("message or imageUrl is required".into()).into());
    }

    let priority: SendPriority = body
        .priority
        .as_deref()
        .unwrap_or("normal")
        .parse()
        .map_err(ApiError::from)?;

    // Human-behavior limits apply to everything except critical traffic.
    if priority != SendPriority::Critical {
        if let Admission::Reject(reason) = gw.behavior.try_admit() {
            return Err(GatewayError::RateLimited(reason.as_str().to_string()).into());
        }
    }

    let (request, kind) = match body.image_url {
        Some(url) => (
            SendRequest {
                target_chat_id: target.clone(),
                text: None,
                media: Some(MediaPayload {
                    kind: MediaKind::Image,
                    source: MediaSource::Url(url),
                    caption: body.message,
                }),
                priority,
            },
            "image",
        ),
        None => (
            SendRequest::text(
                target.clone(),
                body.message.unwrap_or_default(),
                priority,
            ),
            "text",
        ),
    };

    let receipt = gw.sendq.send(request).await?;
    Ok(Json(json!({
        "success": true,
        "messageId": receipt.message_id,
        "target": target,
        "type": kind,
    })))
}

async fn logout(State(gw): State<Arc<Gateway>>) -> Json<Value> {
    let report = gw.supervisor.logout().await;
    Json(json!({ "success": true, "details": report }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::supervisor::SessionState;

    #[test]
    fn error_mapping_matches_taxonomy() {
        let cases = [
            (GatewayError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (GatewayError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                GatewayError::RateLimited("x".into()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                GatewayError::TransientClient("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::TerminalClient("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::Store("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn session_state_serializes_screaming() {
        assert_eq!(json!(SessionState::Ready), json!("READY"));
        assert_eq!(json!(SessionState::Qr), json!("QR"));
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use crate::gateway::sendq::tests_support::AlwaysOkClient;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wagate_core::clock::SystemClock;
    use wagate_core::config::Config;
    use wagate_store::Store;

    async fn test_gateway() -> Arc<Gateway> {
        let client = Arc::new(AlwaysOkClient::new());
        let store = Store::in_memory().await.unwrap();
        let gw = Gateway::build(Config::default(), store, client, Arc::new(SystemClock));
        // Endpoint tests that send need the worker running.
        gw.sendq.spawn_worker();
        gw
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_always_200() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["store"], "CONNECTED");
        assert_eq!(json["whatsapp"]["state"], "NONE");
    }

    #[tokio::test]
    async fn status_reports_session_and_behavior() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["sessionId"], "wagate");
        assert_eq!(json["humanBehavior"]["hourly_cap"], 80);
    }

    #[tokio::test]
    async fn qr_code_is_null_before_pairing() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(Request::get("/qr-code").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json["qr"].is_null());
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["isStale"], false);
    }

    #[tokio::test]
    async fn send_message_requires_a_target() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(
                Request::post("/send-message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn send_message_round_trips_through_the_queue() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(
                Request::post("/send-message")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"groupId":"G@g.us","message":"hello","priority":"high"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["target"], "G@g.us");
        assert_eq!(json["type"], "text");
        assert_eq!(json["messageId"], "sent-1");
    }

    #[tokio::test]
    async fn send_message_rate_limit_spares_critical() {
        let gw = test_gateway().await;
        for i in 0..80 {
            gw.behavior.record_processed(&format!("pre{i}"));
        }

        let limited = router(gw.clone())
            .oneshot(
                Request::post("/send-message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jid":"a@c.us","message":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let critical = router(gw)
            .oneshot(
                Request::post("/send-message")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"jid":"a@c.us","message":"hi","priority":"critical"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(critical.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_broadcast_is_404() {
        let app = router(test_gateway().await);
        let response = app
            .oneshot(
                Request::get("/api/broadcast/status/broadcast_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn banker_crud_round_trip_over_http() {
        let gw = test_gateway().await;
        let create = router(gw.clone())
            .oneshot(
                Request::post("/api/bankers")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{
                            "name": "Yvonne",
                            "bank_name": "Premas",
                            "whatsapp_group_id": "gY@g.us",
                            "routing_keywords": ["yvonne"],
                            "priority": 10
                        }"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::OK);
        let created = body_json(create).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let names = router(gw.clone())
            .oneshot(
                Request::get("/api/bankers/bank-names")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(names).await["data"], json!(["Premas"]));

        let toggled = router(gw)
            .oneshot(
                Request::post(format!("/api/bankers/{id}/toggle"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"is_active": false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(toggled).await["data"]["is_active"], json!(false));
    }
}
