//! Image upload endpoint, backed by the ImageKit CDN.
//!
//! Disabled (503) when no ImageKit credentials are configured.

use super::{ApiError, ApiResult};
use crate::gateway::Gateway;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use wagate_core::GatewayError;

/// Upload size cap.
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const IMAGEKIT_UPLOAD_URL: &str = "https://upload.imagekit.io/api/v1/files/upload";

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/api/upload/image", post(upload_image))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024))
}

#[derive(Debug, Deserialize)]
struct ImageKitResponse {
    url: String,
    #[serde(rename = "fileId")]
    file_id: String,
    name: String,
    size: u64,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

async fn upload_image(
    State(gw): State<Arc<Gateway>>,
    mut multipart: Multipart,
) -> ApiResult {
    let Some(imagekit) = gw.cfg.imagekit.clone() else {
        return Err(GatewayError::TransientClient(
            "image upload is disabled: ImageKit is not configured".into(),
        )
        .into());
    };

    let mut file: Option<(String, String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from(GatewayError::Validation(format!("bad multipart: {e}"))))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field
            .file_name()
            .unwrap_or("upload.png")
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::from(GatewayError::Validation(format!("bad upload: {e}"))))?;
        file = Some((filename, content_type, bytes.to_vec()));
    }

    let (filename, content_type, bytes) =
        file.ok_or_else(|| GatewayError::Validation("missing 'image' field".to_string()))?;

    if !content_type.starts_with("image/") {
        return Err(GatewayError::Validation(format!(
            "unsupported content type '{content_type}'"
        ))
        .into());
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(GatewayError::Validation("image exceeds the 5MB limit".into()).into());
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    let form = reqwest::multipart::Form::new()
        .text("file", encoded)
        .text("fileName", filename)
        .text("useUniqueFileName", "true");

    let http = reqwest::Client::new();
    let response = http
        .post(IMAGEKIT_UPLOAD_URL)
        .basic_auth(&imagekit.private_key, Some(""))
        .multipart(form)
        .send()
        .await
        .map_err(|e| GatewayError::TransientClient(format!("imagekit unreachable: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(GatewayError::TerminalClient(format!(
            "imagekit upload failed ({status}): {detail}"
        ))
        .into());
    }

    let uploaded: ImageKitResponse = response
        .json()
        .await
        .map_err(|e| GatewayError::TerminalClient(format!("imagekit response decode: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "url": uploaded.url,
        "fileId": uploaded.file_id,
        "name": uploaded.name,
        "size": uploaded.size,
        "dimensions": {
            "width": uploaded.width,
            "height": uploaded.height,
        },
    })))
}
