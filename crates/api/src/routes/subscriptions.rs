//! Donor-initiated subscription actions

use axum::{
    extract::{Path, State},
    Json,
};
use donorledger_billing::Subscription;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

/// POST /subscriptions/{id}/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing_service()?;
    let subscription = billing.subscriptions.cancel_subscription(id).await?;
    Ok(Json(subscription))
}

/// POST /subscriptions/{id}/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing_service()?;
    let subscription = billing.subscriptions.reactivate_subscription(id).await?;
    Ok(Json(subscription))
}
