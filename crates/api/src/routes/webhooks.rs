//! Payment provider webhook endpoint
//!
//! The provider retries on any non-2xx, so business no-ops are acknowledged
//! as success; only signature failures and processing errors get an error
//! status.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use sekolah_billing::WebhookAck;

use crate::error::ApiResult;
use crate::state::AppState;

/// Header the provider sends its verification token in.
const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/payment", post(handle_payment_webhook))
}

async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let token = headers
        .get(CALLBACK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state
        .billing
        .webhooks
        .handle_notification(&body, token)
        .await?;

    let processed = matches!(ack, WebhookAck::Processed);
    Ok(Json(json!({ "success": true, "processed": processed })))
}
