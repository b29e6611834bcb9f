//! Webhook administration routes
//!
//! Protected by a static bearer token (`ADMIN_API_TOKEN`). With no token
//! configured every request is rejected.

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use donorledger_billing::{EventOutcome, WebhookEventRecord, WebhookReplayResult};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let expected = state
        .config
        .admin_api_token
        .as_deref()
        .ok_or(ApiError::Unauthorized)?;

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Rejected admin request with invalid token");
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListWebhooksResponse {
    pub events: Vec<WebhookEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

/// GET /admin/webhooks
pub async fn list_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<ListWebhooksResponse>> {
    require_admin(&state, &headers)?;

    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EventOutcome>().map_err(ApiError::BadRequest))
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state.ledger.list_events(status, limit, offset).await?;

    Ok(Json(ListWebhooksResponse {
        events,
        limit,
        offset,
    }))
}

/// POST /admin/webhooks/{event_id}/replay
pub async fn replay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    require_admin(&state, &headers)?;
    let billing = state.billing_service()?;

    let result = billing.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(result))
}
