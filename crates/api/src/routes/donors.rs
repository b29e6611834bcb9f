//! Donor payment method setup

use axum::{
    extract::{Path, State},
    Json,
};
use donorledger_billing::SetupIntentSecret;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

/// POST /donors/{id}/setup-payment
pub async fn setup_payment(
    State(state): State<AppState>,
    Path(donor_id): Path<Uuid>,
) -> ApiResult<Json<SetupIntentSecret>> {
    let billing = state.billing_service()?;
    let secret = billing.payments.setup_payment(donor_id).await?;
    Ok(Json(secret))
}
