//! HTTP route definitions

pub mod billing;
pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/subscriptions", post(billing::create_subscription))
        .route("/api/subscriptions/change-plan", post(billing::change_plan))
        .route("/api/subscriptions/cancel", post(billing::cancel_subscription))
        .route("/api/subscriptions/status", get(billing::subscription_status))
        .route("/api/webhook", post(billing::stripe_webhook))
        .with_state(state)
}
