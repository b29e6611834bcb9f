//! Ledger records
//!
//! Donors, organizations and packages are owned by the dashboards; the
//! ledger reads them. Subscriptions and transactions mirror processor state.

use donorledger_shared::{BillingInterval, SubscriptionStatus, TransactionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Donor {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub email: String,
    pub name: Option<String>,
    pub stripe_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Package {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub interval: BillingInterval,
}

/// Local mirror of a processor subscription
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub package_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub interval: BillingInterval,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// The mutable part of this row
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState {
            status: self.status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            canceled_at: self.canceled_at,
            amount_cents: self.amount_cents,
            currency: self.currency.clone(),
            interval: self.interval,
        }
    }

    pub(crate) fn apply(&mut self, state: &SubscriptionState) {
        self.status = state.status;
        self.current_period_start = state.current_period_start;
        self.current_period_end = state.current_period_end;
        self.cancel_at_period_end = state.cancel_at_period_end;
        self.trial_start = state.trial_start;
        self.trial_end = state.trial_end;
        self.canceled_at = state.canceled_at;
        self.amount_cents = state.amount_cents;
        self.currency = state.currency.clone();
        self.interval = state.interval;
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// Fields a webhook or a cancel/reactivate call may change on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub amount_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub package_id: Uuid,
    pub state: SubscriptionState,
}

/// One payment attempt against a subscription invoice
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionTransaction {
    pub id: Uuid,
    pub stripe_invoice_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub subscription_id: Uuid,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    pub attempt_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSubscriptionTransaction {
    pub stripe_invoice_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub subscription_id: Uuid,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    pub attempt_count: i32,
    pub paid_at: Option<OffsetDateTime>,
}

/// One-off donation payment
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub stripe_payment_intent_id: String,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub package_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub stripe_payment_intent_id: String,
    pub donor_id: Uuid,
    pub organization_id: Uuid,
    pub package_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
}

/// Status correction applied to an existing payment row.
///
/// `None` fields keep their stored value.
#[derive(Debug, Clone)]
pub struct PaymentCorrection {
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    pub attempt_count: Option<i32>,
    pub paid_at: Option<OffsetDateTime>,
    pub stripe_payment_intent_id: Option<String>,
}

/// Processing state of a recorded webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Processing,
    Success,
    Error,
    Skipped,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Processing => "processing",
            EventOutcome::Success => "success",
            EventOutcome::Error => "error",
            EventOutcome::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for EventOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(EventOutcome::Processing),
            "success" => Ok(EventOutcome::Success),
            "error" => Ok(EventOutcome::Error),
            "skipped" => Ok(EventOutcome::Skipped),
            other => Err(format!("unknown processing result: {}", other)),
        }
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(skip_serializing)]
    pub payload: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
}
