//! Ledger storage
//!
//! The webhook handlers and the membership aggregator only talk to the
//! database through [`Ledger`]. [`PgLedger`] is the production store;
//! [`MemoryLedger`] backs tests and local runs without Postgres.
//!
//! Every remote id (subscription, invoice, payment intent, event) is unique
//! in the store, and inserts that lose a race resolve to the existing row.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    Donor, EventOutcome, NewSubscription, NewSubscriptionTransaction, NewTransaction, Package,
    PaymentCorrection, Subscription, SubscriptionState, SubscriptionTransaction, Transaction,
    WebhookEventRecord,
};

/// Minutes after which an event stuck in `processing` may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// How a donor is identified by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonorLookup {
    Id(Uuid),
    Email(String),
}

impl std::fmt::Display for DonorLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DonorLookup::Id(id) => write!(f, "id {}", id),
            DonorLookup::Email(email) => write!(f, "email {}", email),
        }
    }
}

/// Optional created-at window, both ends inclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
}

impl DateRange {
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// New webhook event to be claimed for processing
#[derive(Debug, Clone, Copy)]
pub struct EventClaim<'a> {
    pub stripe_event_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a str,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // Reference entities

    async fn find_donor(&self, lookup: &DonorLookup) -> BillingResult<Option<Donor>>;

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool>;

    /// Record the processor customer id for a donor
    async fn set_donor_customer_id(
        &self,
        donor_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<()>;

    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<Package>>;

    // Subscriptions

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_remote_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert a subscription. If a row with the same remote id already
    /// exists its mutable fields are updated instead.
    async fn insert_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription>;

    /// Update the mutable fields of a known subscription.
    ///
    /// Returns `None` when no row has this remote id.
    async fn update_subscription_state(
        &self,
        stripe_subscription_id: &str,
        state: &SubscriptionState,
    ) -> BillingResult<Option<Subscription>>;

    async fn list_donor_subscriptions(&self, donor_id: Uuid) -> BillingResult<Vec<Subscription>>;

    // Subscription transactions

    async fn find_subscription_transaction(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>>;

    async fn find_subscription_transaction_by_payment_intent(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>>;

    /// Insert a row, or return the existing row for the same invoice id untouched
    async fn insert_subscription_transaction(
        &self,
        new: &NewSubscriptionTransaction,
    ) -> BillingResult<SubscriptionTransaction>;

    async fn correct_subscription_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<SubscriptionTransaction>;

    async fn list_donor_subscription_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<SubscriptionTransaction>>;

    // One-off transactions

    async fn find_transaction(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<Transaction>>;

    /// Insert a row, or return the existing row for the same payment intent untouched
    async fn insert_transaction(&self, new: &NewTransaction) -> BillingResult<Transaction>;

    async fn correct_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<Transaction>;

    async fn list_donor_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<Transaction>>;

    // Webhook event log

    /// Atomically claim an event for processing.
    ///
    /// Returns `false` when the event was already claimed, unless that claim
    /// has been stuck in `processing` for longer than
    /// [`PROCESSING_TIMEOUT_MINUTES`].
    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<bool>;

    /// Put an already recorded event back into `processing` (replay)
    async fn restart_event(&self, stripe_event_id: &str) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_date_range_is_inclusive() {
        let range = DateRange {
            from: Some(datetime!(2025-01-01 0:00 UTC)),
            to: Some(datetime!(2025-01-31 0:00 UTC)),
        };

        assert!(range.contains(datetime!(2025-01-01 0:00 UTC)));
        assert!(range.contains(datetime!(2025-01-31 0:00 UTC)));
        assert!(!range.contains(datetime!(2024-12-31 23:59 UTC)));
        assert!(!range.contains(datetime!(2025-02-01 0:00 UTC)));
    }

    #[test]
    fn test_open_date_range_contains_everything() {
        let range = DateRange::default();
        assert!(range.contains(OffsetDateTime::UNIX_EPOCH));
        assert!(range.contains(OffsetDateTime::now_utc()));
    }
}
