//! Tenant payment routes
//!
//! Creating a payment and polling its status. Every lookup is scoped to the
//! tenant in the path; a transaction belonging to another tenant is
//! indistinguishable from one that does not exist.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use sekolah_billing::{CreatePaymentInput, CreatedPaymentResponse, PaymentTransaction};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tenants/{tenant_id}/payments", post(create_payment))
        .route(
            "/api/tenants/{tenant_id}/payments/{transaction_id}",
            get(get_payment_status),
        )
}

async fn create_payment(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<CreatePaymentInput>,
) -> ApiResult<Json<CreatedPaymentResponse>> {
    Ok(Json(
        state.billing.payments.create_payment(tenant_id, input).await?,
    ))
}

/// Poll one transaction. A pending transaction is reconciled against the
/// provider on the way out, so this doubles as the lazy recovery path when
/// a webhook was missed.
async fn get_payment_status(
    State(state): State<AppState>,
    Path((tenant_id, transaction_id)): Path<(Uuid, i64)>,
) -> ApiResult<Json<PaymentTransaction>> {
    Ok(Json(
        state
            .billing
            .payments
            .get_payment_status(tenant_id, transaction_id)
            .await?,
    ))
}
