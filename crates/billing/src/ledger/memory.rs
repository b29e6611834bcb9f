//! In-memory ledger store
//!
//! Mirrors the uniqueness rules of the Postgres schema so handler behaviour
//! under duplicate delivery is the same on both stores.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DateRange, DonorLookup, EventClaim, Ledger, PROCESSING_TIMEOUT_MINUTES};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Donor, EventOutcome, NewSubscription, NewSubscriptionTransaction, NewTransaction, Package,
    PaymentCorrection, Subscription, SubscriptionState, SubscriptionTransaction, Transaction,
    WebhookEventRecord,
};

#[derive(Default)]
struct MemoryState {
    organizations: HashSet<Uuid>,
    donors: HashMap<Uuid, Donor>,
    packages: HashMap<Uuid, Package>,
    subscriptions: HashMap<Uuid, Subscription>,
    subscription_transactions: HashMap<Uuid, SubscriptionTransaction>,
    transactions: HashMap<Uuid, Transaction>,
    events: HashMap<String, WebhookEventRecord>,
    writes: u64,
}

/// Ledger kept in process memory
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_organization(&self, organization_id: Uuid) {
        self.state.write().await.organizations.insert(organization_id);
    }

    /// Insert a donor, registering its organization
    pub async fn insert_donor(&self, donor: Donor) {
        let mut state = self.state.write().await;
        if let Some(organization_id) = donor.organization_id {
            state.organizations.insert(organization_id);
        }
        state.donors.insert(donor.id, donor);
    }

    /// Insert a package, registering its organization
    pub async fn insert_package(&self, package: Package) {
        let mut state = self.state.write().await;
        state.organizations.insert(package.organization_id);
        state.packages.insert(package.id, package);
    }

    /// Make every subsequent write fail with a database error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes since creation
    pub async fn write_count(&self) -> u64 {
        self.state.read().await.writes
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    pub async fn subscription_transaction_count(&self) -> usize {
        self.state.read().await.subscription_transactions.len()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    fn check_writable(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "memory ledger is rejecting writes".to_string(),
            ));
        }
        Ok(())
    }
}

fn sorted_newest_first<T, F>(mut rows: Vec<T>, created_at: F) -> Vec<T>
where
    F: Fn(&T) -> OffsetDateTime,
{
    rows.sort_by_key(|row| std::cmp::Reverse(created_at(row)));
    rows
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn find_donor(&self, lookup: &DonorLookup) -> BillingResult<Option<Donor>> {
        let state = self.state.read().await;
        let donor = match lookup {
            DonorLookup::Id(id) => state.donors.get(id).cloned(),
            DonorLookup::Email(email) => state
                .donors
                .values()
                .find(|d| d.email.eq_ignore_ascii_case(email))
                .cloned(),
        };
        Ok(donor)
    }

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .organizations
            .contains(&organization_id))
    }

    async fn set_donor_customer_id(
        &self,
        donor_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let donor = state
            .donors
            .get_mut(&donor_id)
            .ok_or_else(|| BillingError::NotFound(format!("donor {}", donor_id)))?;
        donor.stripe_customer_id = Some(stripe_customer_id.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<Package>> {
        Ok(self.state.read().await.packages.get(&package_id).cloned())
    }

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(&id).cloned())
    }

    async fn find_subscription_by_remote_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .cloned())
    }

    async fn insert_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.writes += 1;

        if let Some(existing) = state
            .subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id == new.stripe_subscription_id)
        {
            existing.apply(&new.state);
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let state_fields = &new.state;
        let subscription = Subscription {
            id: Uuid::new_v4(),
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            stripe_customer_id: new.stripe_customer_id.clone(),
            donor_id: new.donor_id,
            organization_id: new.organization_id,
            package_id: new.package_id,
            status: state_fields.status,
            current_period_start: state_fields.current_period_start,
            current_period_end: state_fields.current_period_end,
            cancel_at_period_end: state_fields.cancel_at_period_end,
            trial_start: state_fields.trial_start,
            trial_end: state_fields.trial_end,
            canceled_at: state_fields.canceled_at,
            amount_cents: state_fields.amount_cents,
            currency: state_fields.currency.clone(),
            interval: state_fields.interval,
            created_at: now,
            updated_at: now,
        };
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription_state(
        &self,
        stripe_subscription_id: &str,
        subscription_state: &SubscriptionState,
    ) -> BillingResult<Option<Subscription>> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let updated = state
            .subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .map(|existing| {
                existing.apply(subscription_state);
                existing.clone()
            });
        if updated.is_some() {
            state.writes += 1;
        }
        Ok(updated)
    }

    async fn list_donor_subscriptions(&self, donor_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let rows = state
            .subscriptions
            .values()
            .filter(|s| s.donor_id == donor_id)
            .cloned()
            .collect();
        Ok(sorted_newest_first(rows, |s: &Subscription| s.created_at))
    }

    async fn find_subscription_transaction(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .subscription_transactions
            .values()
            .find(|t| t.stripe_invoice_id == stripe_invoice_id)
            .cloned())
    }

    async fn find_subscription_transaction_by_payment_intent(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .subscription_transactions
            .values()
            .find(|t| t.stripe_payment_intent_id.as_deref() == Some(stripe_payment_intent_id))
            .cloned())
    }

    async fn insert_subscription_transaction(
        &self,
        new: &NewSubscriptionTransaction,
    ) -> BillingResult<SubscriptionTransaction> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .subscription_transactions
            .values()
            .find(|t| t.stripe_invoice_id == new.stripe_invoice_id)
        {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let row = SubscriptionTransaction {
            id: Uuid::new_v4(),
            stripe_invoice_id: new.stripe_invoice_id.clone(),
            stripe_payment_intent_id: new.stripe_payment_intent_id.clone(),
            subscription_id: new.subscription_id,
            donor_id: new.donor_id,
            organization_id: new.organization_id,
            amount_cents: new.amount_cents,
            currency: new.currency.clone(),
            status: new.status,
            failure_reason: new.failure_reason.clone(),
            attempt_count: new.attempt_count,
            paid_at: new.paid_at,
            created_at: now,
            updated_at: now,
        };
        state.subscription_transactions.insert(row.id, row.clone());
        state.writes += 1;
        Ok(row)
    }

    async fn correct_subscription_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<SubscriptionTransaction> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let row = state
            .subscription_transactions
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription transaction {}", id)))?;

        row.status = correction.status;
        row.failure_reason = correction.failure_reason.clone();
        if let Some(attempts) = correction.attempt_count {
            row.attempt_count = attempts;
        }
        if correction.paid_at.is_some() {
            row.paid_at = correction.paid_at;
        }
        if correction.stripe_payment_intent_id.is_some() {
            row.stripe_payment_intent_id = correction.stripe_payment_intent_id.clone();
        }
        row.updated_at = OffsetDateTime::now_utc();

        let row = row.clone();
        state.writes += 1;
        Ok(row)
    }

    async fn list_donor_subscription_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<SubscriptionTransaction>> {
        let state = self.state.read().await;
        let rows = state
            .subscription_transactions
            .values()
            .filter(|t| t.donor_id == donor_id && range.contains(t.created_at))
            .cloned()
            .collect();
        Ok(sorted_newest_first(rows, |t: &SubscriptionTransaction| {
            t.created_at
        }))
    }

    async fn find_transaction(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.stripe_payment_intent_id == stripe_payment_intent_id)
            .cloned())
    }

    async fn insert_transaction(&self, new: &NewTransaction) -> BillingResult<Transaction> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .transactions
            .values()
            .find(|t| t.stripe_payment_intent_id == new.stripe_payment_intent_id)
        {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let row = Transaction {
            id: Uuid::new_v4(),
            stripe_payment_intent_id: new.stripe_payment_intent_id.clone(),
            donor_id: new.donor_id,
            organization_id: new.organization_id,
            package_id: new.package_id,
            amount_cents: new.amount_cents,
            currency: new.currency.clone(),
            status: new.status,
            failure_reason: new.failure_reason.clone(),
            created_at: now,
            updated_at: now,
        };
        state.transactions.insert(row.id, row.clone());
        state.writes += 1;
        Ok(row)
    }

    async fn correct_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<Transaction> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let row = state
            .transactions
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("transaction {}", id)))?;

        row.status = correction.status;
        row.failure_reason = correction.failure_reason.clone();
        row.updated_at = OffsetDateTime::now_utc();

        let row = row.clone();
        state.writes += 1;
        Ok(row)
    }

    async fn list_donor_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let rows = state
            .transactions
            .values()
            .filter(|t| t.donor_id == donor_id && range.contains(t.created_at))
            .cloned()
            .collect();
        Ok(sorted_newest_first(rows, |t: &Transaction| t.created_at))
    }

    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = state.events.get_mut(claim.stripe_event_id) {
            let stale = existing.processing_result == EventOutcome::Processing.as_str()
                && existing.processing_started_at.is_some_and(|started| {
                    now - started > time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES)
                });
            if !stale {
                return Ok(false);
            }
            existing.processing_started_at = Some(now);
            existing.error_message = Some(format!("Recovered from stuck state at {}", now));
            state.writes += 1;
            return Ok(true);
        }

        state.events.insert(
            claim.stripe_event_id.to_string(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: claim.stripe_event_id.to_string(),
                event_type: claim.event_type.to_string(),
                payload: claim.payload.to_string(),
                processing_result: EventOutcome::Processing.as_str().to_string(),
                error_message: None,
                received_at: now,
                processing_started_at: Some(now),
            },
        );
        state.writes += 1;
        Ok(true)
    }

    async fn restart_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let Some(record) = state.events.get_mut(stripe_event_id) else {
            return Ok(false);
        };
        record.processing_result = EventOutcome::Processing.as_str().to_string();
        record.processing_started_at = Some(OffsetDateTime::now_utc());
        state.writes += 1;
        Ok(true)
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if let Some(record) = state.events.get_mut(stripe_event_id) {
            record.processing_result = outcome.as_str().to_string();
            record.error_message = error_message.map(str::to_string);
            state.writes += 1;
        }
        Ok(())
    }

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.state.read().await.events.get(stripe_event_id).cloned())
    }

    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.read().await;
        let rows: Vec<WebhookEventRecord> = state
            .events
            .values()
            .filter(|e| outcome.map_or(true, |o| e.processing_result == o.as_str()))
            .cloned()
            .collect();
        let rows = sorted_newest_first(rows, |e: &WebhookEventRecord| e.received_at);

        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donorledger_shared::{BillingInterval, SubscriptionStatus, TransactionStatus};

    fn state(status: SubscriptionStatus) -> SubscriptionState {
        SubscriptionState {
            status,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_start: None,
            trial_end: None,
            canceled_at: None,
            amount_cents: 2500,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
        }
    }

    fn new_subscription(remote_id: &str, status: SubscriptionStatus) -> NewSubscription {
        NewSubscription {
            stripe_subscription_id: remote_id.to_string(),
            stripe_customer_id: Some("cus_1".to_string()),
            donor_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            package_id: Uuid::new_v4(),
            state: state(status),
        }
    }

    #[tokio::test]
    async fn test_insert_subscription_twice_keeps_one_row() {
        let ledger = MemoryLedger::new();

        let first = ledger
            .insert_subscription(&new_subscription("sub_1", SubscriptionStatus::Trialing))
            .await
            .unwrap();
        let second = ledger
            .insert_subscription(&new_subscription("sub_1", SubscriptionStatus::Active))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, SubscriptionStatus::Active);
        assert_eq!(ledger.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_subscription_returns_none() {
        let ledger = MemoryLedger::new();
        let updated = ledger
            .update_subscription_state("sub_missing", &state(SubscriptionStatus::Canceled))
            .await
            .unwrap();

        assert!(updated.is_none());
        assert_eq!(ledger.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_insert_transaction_returns_existing_row_untouched() {
        let ledger = MemoryLedger::new();
        let new = NewTransaction {
            stripe_payment_intent_id: "pi_1".to_string(),
            donor_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            package_id: None,
            amount_cents: 1000,
            currency: "usd".to_string(),
            status: TransactionStatus::Succeeded,
            failure_reason: None,
        };

        let first = ledger.insert_transaction(&new).await.unwrap();
        let again = ledger
            .insert_transaction(&NewTransaction {
                status: TransactionStatus::Failed,
                ..new.clone()
            })
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.status, TransactionStatus::Succeeded);
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_claim_event_only_once() {
        let ledger = MemoryLedger::new();
        let claim = EventClaim {
            stripe_event_id: "evt_1",
            event_type: "invoice.paid",
            payload: "{}",
        };

        assert!(ledger.claim_event(&claim).await.unwrap());
        assert!(!ledger.claim_event(&claim).await.unwrap());

        ledger
            .finish_event("evt_1", EventOutcome::Success, None)
            .await
            .unwrap();
        assert!(!ledger.claim_event(&claim).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_writes_rejects_mutations() {
        let ledger = MemoryLedger::new();
        ledger.set_fail_writes(true);

        let result = ledger
            .insert_subscription(&new_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        assert!(matches!(result, Err(BillingError::Database(_))));
        assert_eq!(ledger.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_list_events_filters_by_outcome() {
        let ledger = MemoryLedger::new();
        for id in ["evt_a", "evt_b", "evt_c"] {
            ledger
                .claim_event(&EventClaim {
                    stripe_event_id: id,
                    event_type: "invoice.paid",
                    payload: "{}",
                })
                .await
                .unwrap();
        }
        ledger
            .finish_event("evt_a", EventOutcome::Error, Some("boom"))
            .await
            .unwrap();
        ledger
            .finish_event("evt_b", EventOutcome::Success, None)
            .await
            .unwrap();

        let errors = ledger
            .list_events(Some(EventOutcome::Error), 10, 0)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stripe_event_id, "evt_a");
        assert_eq!(errors[0].error_message.as_deref(), Some("boom"));

        let all = ledger.list_events(None, 2, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
