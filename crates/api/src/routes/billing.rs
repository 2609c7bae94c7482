//! Subscription and webhook endpoints

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use workbridge_billing::PlanChangeOutcome;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub price_id: String,
    pub payment_method_id: String,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<Value>> {
    let created = state
        .billing
        .subscriptions
        .create_subscription(user.user_id, &req.price_id, &req.payment_method_id)
        .await?;
    Ok(Json(json!({
        "subscription_id": created.subscription_id,
        "status": created.status,
        "client_secret": created.client_secret,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub price_id: String,
    pub payment_method_id: String,
}

pub async fn change_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .billing
        .subscriptions
        .change_plan(user.user_id, &req.price_id, &req.payment_method_id)
        .await?;
    let body = match outcome {
        PlanChangeOutcome::Unchanged => json!({ "result": "unchanged" }),
        PlanChangeOutcome::Upgraded { plan } => {
            json!({ "result": "upgraded", "plan": plan })
        }
        PlanChangeOutcome::DowngradeScheduled { target } => {
            json!({ "result": "downgrade_scheduled", "target": target })
        }
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    pub cancel_at_period_end: bool,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CancelSubscriptionRequest>,
) -> ApiResult<Json<Value>> {
    state
        .billing
        .subscriptions
        .cancel_subscription(user.user_id, req.cancel_at_period_end)
        .await?;
    Ok(Json(json!({
        "cancel_at_period_end": req.cancel_at_period_end,
    })))
}

/// Returns the subscription only while it is usable; lapsed and absent look
/// the same to clients
pub async fn subscription_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Value>> {
    let record = state
        .billing
        .subscriptions
        .check_status(user.user_id)
        .await?;
    Ok(Json(json!({ "subscription": record })))
}

/// Stripe webhook entry point
///
/// An invalid signature is the only 400; handler failures are logged and
/// acknowledged so the processor does not retry indefinitely.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = match state.billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "rejected webhook with invalid signature");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "INVALID_SIGNATURE" })),
            )
                .into_response();
        }
    };

    if let Err(e) = state.billing.webhooks.handle_event(event).await {
        tracing::error!(error = %e, "webhook processing failed, acknowledging anyway");
    }
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}
