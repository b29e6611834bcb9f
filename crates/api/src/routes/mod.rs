//! HTTP routes

pub mod admin;
pub mod donors;
pub mod membership;
pub mod subscriptions;
pub mod webhooks;


use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/membership",
            get(membership::get_membership).post(membership::post_membership),
        )
        .route(
            "/subscriptions/{id}/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/subscriptions/{id}/reactivate",
            post(subscriptions::reactivate_subscription),
        )
        .route("/donors/{id}/setup-payment", post(donors::setup_payment))
        .route("/admin/webhooks", get(admin::list_webhooks))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
