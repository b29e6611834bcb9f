//! Membership status routes

use axum::{
    extract::{Query, State},
    Json,
};
use donorledger_billing::{DateRange, DonorLookup, MembershipQuery, MembershipReport};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Lookup fields shared by the query string and JSON forms
#[derive(Debug, Default, Deserialize)]
pub struct MembershipParams {
    pub donor_id: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    /// RFC 3339 lower bound on payment creation time
    pub from: Option<String>,
    /// RFC 3339 upper bound on payment creation time
    pub to: Option<String>,
}

fn parse_time(field: &str, raw: Option<&str>) -> ApiResult<Option<OffsetDateTime>> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            OffsetDateTime::parse(s, &Rfc3339).map_err(|_| {
                ApiError::BadRequest(format!("{} must be an RFC 3339 timestamp", field))
            })
        })
        .transpose()
}

impl MembershipParams {
    fn into_query(self) -> ApiResult<MembershipQuery> {
        let donor_id = self.donor_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let email = self.email.as_deref().map(str::trim).filter(|s| !s.is_empty());

        // donor_id wins when both are given
        let donor = match (donor_id, email) {
            (Some(id), _) => DonorLookup::Id(
                Uuid::parse_str(id)
                    .map_err(|_| ApiError::BadRequest("donor_id must be a UUID".to_string()))?,
            ),
            (None, Some(email)) => DonorLookup::Email(email.to_string()),
            (None, None) => {
                return Err(ApiError::BadRequest(
                    "donor_id or email is required".to_string(),
                ))
            }
        };

        let range = DateRange {
            from: parse_time("from", self.from.as_deref())?,
            to: parse_time("to", self.to.as_deref())?,
        };
        if let (Some(from), Some(to)) = (range.from, range.to) {
            if from > to {
                return Err(ApiError::BadRequest(
                    "from must not be after to".to_string(),
                ));
            }
        }

        Ok(MembershipQuery {
            donor,
            include_inactive: self.include_inactive,
            range,
        })
    }
}

async fn report(state: &AppState, params: MembershipParams) -> ApiResult<Json<MembershipReport>> {
    let query = params.into_query()?;
    let report = state.membership.membership(&query).await?;
    Ok(Json(report))
}

/// GET /membership
pub async fn get_membership(
    State(state): State<AppState>,
    Query(params): Query<MembershipParams>,
) -> ApiResult<Json<MembershipReport>> {
    report(&state, params).await
}

/// POST /membership
pub async fn post_membership(
    State(state): State<AppState>,
    Json(params): Json<MembershipParams>,
) -> ApiResult<Json<MembershipReport>> {
    report(&state, params).await
}
