//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use donorledger_billing::WebhookOutcome;
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Verify and apply one Stripe delivery.
///
/// Anything short of a failed idempotency claim is acknowledged with 200 so
/// Stripe stops retrying; handler failures are kept on the event record for
/// replay from the admin routes.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookResponse>> {
    let billing = state.billing_service()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected webhook delivery");
            ApiError::BadRequest("Invalid webhook signature or payload".to_string())
        })?;

    let outcome = billing
        .webhooks
        .handle_event(&event, &body)
        .await
        .map_err(|e| {
            tracing::error!(
                stripe_event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Could not record webhook delivery"
            );
            ApiError::Internal(e.to_string())
        })?;

    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}
