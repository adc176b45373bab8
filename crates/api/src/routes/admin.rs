//! Platform admin routes
//!
//! Plan catalog management and subscription administration. Authentication
//! and role checks live in the platform gateway in front of this service;
//! these handlers assume an already-authorized caller.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use sekolah_billing::{
    BillingHistoryEntry, CountUpdateResult, CreateSubscription, InvariantCheckSummary, PlanInput,
    SubscriptionPlan, TenantSubscription,
};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/plans", get(list_active_plans))
        .route("/api/admin/plans", get(list_all_plans).post(create_plan))
        .route("/api/admin/plans/{plan_id}", get(get_plan).put(update_plan))
        .route("/api/admin/subscriptions", post(create_subscription))
        .route(
            "/api/admin/subscriptions/expiring",
            get(list_expiring_subscriptions),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription",
            get(get_subscription),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/student-count",
            put(update_student_count),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/change-plan",
            post(change_plan),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/mark-paid",
            post(mark_as_paid),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/renew",
            post(renew),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/suspend",
            post(suspend),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/activate",
            post(activate),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/subscription/cancel",
            post(cancel),
        )
        .route(
            "/api/admin/tenants/{tenant_id}/billing-history",
            get(billing_history),
        )
        .route("/api/admin/invariants", get(run_invariants))
}

// =============================================================================
// Plans
// =============================================================================

async fn list_active_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(state.billing.plans.list_active_plans().await?))
}

async fn list_all_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(state.billing.plans.list_all_plans().await?))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> ApiResult<Json<SubscriptionPlan>> {
    Ok(Json(state.billing.plans.get_plan(plan_id).await?))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(input): Json<PlanInput>,
) -> ApiResult<Json<SubscriptionPlan>> {
    Ok(Json(state.billing.plans.create_plan(input).await?))
}

async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(input): Json<PlanInput>,
) -> ApiResult<Json<SubscriptionPlan>> {
    Ok(Json(state.billing.plans.update_plan(plan_id, input).await?))
}

// =============================================================================
// Subscriptions
// =============================================================================

async fn create_subscription(
    State(state): State<AppState>,
    Json(input): Json<CreateSubscription>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(
        state.billing.subscriptions.create_subscription(input).await?,
    ))
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(
        state.billing.subscriptions.get_subscription(tenant_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct StudentCountBody {
    student_count: i32,
}

async fn update_student_count(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<StudentCountBody>,
) -> ApiResult<Json<CountUpdateResult>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .update_student_count(tenant_id, body.student_count)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ChangePlanBody {
    plan_id: i64,
}

async fn change_plan(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<ChangePlanBody>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .change_plan(tenant_id, body.plan_id)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct MarkPaidBody {
    #[serde(default, with = "time::serde::rfc3339::option")]
    paid_at: Option<OffsetDateTime>,
}

async fn mark_as_paid(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    body: Option<Json<MarkPaidBody>>,
) -> ApiResult<Json<TenantSubscription>> {
    let paid_at = body.and_then(|Json(b)| b.paid_at);
    Ok(Json(
        state
            .billing
            .subscriptions
            .mark_as_paid(tenant_id, paid_at)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct RenewBody {
    #[serde(with = "time::serde::rfc3339")]
    end_date: OffsetDateTime,
}

async fn renew(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<RenewBody>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .renew(tenant_id, body.end_date)
            .await?,
    ))
}

async fn suspend(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(state.billing.subscriptions.suspend(tenant_id).await?))
}

async fn activate(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(state.billing.subscriptions.activate(tenant_id).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantSubscription>> {
    Ok(Json(state.billing.subscriptions.cancel(tenant_id).await?))
}

#[derive(Debug, Deserialize)]
struct ExpiringQuery {
    #[serde(default = "default_expiring_days")]
    days: i64,
}

fn default_expiring_days() -> i64 {
    7
}

async fn list_expiring_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ExpiringQuery>,
) -> ApiResult<Json<Vec<TenantSubscription>>> {
    Ok(Json(
        state.billing.subscriptions.list_expiring(query.days).await?,
    ))
}

// =============================================================================
// History and diagnostics
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

async fn billing_history(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<BillingHistoryEntry>>> {
    Ok(Json(
        state
            .billing
            .history
            .list_for_tenant(tenant_id, query.limit.clamp(1, 500))
            .await?,
    ))
}

async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}
