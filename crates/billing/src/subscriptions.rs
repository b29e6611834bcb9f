//! Subscription management
//!
//! Donor-initiated cancel and reactivate. The processor is updated first and
//! the state it returns is written to the local row, so the ledger never
//! claims a change the processor did not accept.

use std::sync::Arc;

use donorledger_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::Ledger;
use crate::models::{Subscription, SubscriptionState};
use crate::processor::{PaymentProcessor, RemoteSubscription};

/// Overlay processor state on a stored state; absent remote fields keep
/// their stored value
fn merge_remote(mut state: SubscriptionState, remote: &RemoteSubscription) -> SubscriptionState {
    state.status = remote.status;
    state.cancel_at_period_end = remote.cancel_at_period_end;
    state.current_period_start = remote.current_period_start.or(state.current_period_start);
    state.current_period_end = remote.current_period_end.or(state.current_period_end);
    state.trial_end = remote.trial_end.or(state.trial_end);
    state.canceled_at = remote.canceled_at;
    if let Some(amount) = remote.amount_cents {
        state.amount_cents = amount;
    }
    if let Some(currency) = &remote.currency {
        state.currency = currency.clone();
    }
    if let Some(interval) = remote.interval {
        state.interval = interval;
    }
    state
}

pub struct SubscriptionService {
    ledger: Arc<dyn Ledger>,
    processor: Arc<dyn PaymentProcessor>,
}

impl SubscriptionService {
    pub fn new(ledger: Arc<dyn Ledger>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { ledger, processor }
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        self.ledger
            .find_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", id)))
    }

    /// Cancel a subscription at end of billing period
    pub async fn cancel_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        let subscription = self.get_subscription(id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidInput(format!(
                "Subscription {} is already canceled",
                id
            )));
        }

        let updated = self.set_cancel_at_period_end(&subscription, true).await?;

        tracing::info!(
            subscription_id = %id,
            stripe_subscription_id = %updated.stripe_subscription_id,
            donor_id = %updated.donor_id,
            "Scheduled subscription cancellation"
        );
        Ok(updated)
    }

    /// Undo a scheduled cancellation
    pub async fn reactivate_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        let subscription = self.get_subscription(id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidInput(format!(
                "Subscription {} has ended and cannot be reactivated",
                id
            )));
        }

        let updated = self.set_cancel_at_period_end(&subscription, false).await?;

        tracing::info!(
            subscription_id = %id,
            stripe_subscription_id = %updated.stripe_subscription_id,
            donor_id = %updated.donor_id,
            "Reactivated subscription"
        );
        Ok(updated)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription: &Subscription,
        cancel: bool,
    ) -> BillingResult<Subscription> {
        let remote = self
            .processor
            .set_cancel_at_period_end(&subscription.stripe_subscription_id, cancel)
            .await?;

        let state = merge_remote(subscription.state(), &remote);
        self.ledger
            .update_subscription_state(&subscription.stripe_subscription_id, &state)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Processor accepted the change but the local row was not updated"
                );
                e
            })?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::NewSubscription;
    use crate::testing::{remote_subscription, FailingProcessor, ScriptedProcessor};
    use donorledger_shared::BillingInterval;

    async fn seeded(status: SubscriptionStatus) -> (Arc<MemoryLedger>, Subscription) {
        let ledger = Arc::new(MemoryLedger::new());
        let subscription = ledger
            .insert_subscription(&NewSubscription {
                stripe_subscription_id: "sub_1".to_string(),
                stripe_customer_id: Some("cus_test".to_string()),
                donor_id: Uuid::new_v4(),
                organization_id: Uuid::new_v4(),
                package_id: Uuid::new_v4(),
                state: SubscriptionState {
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
                },
            })
            .await
            .unwrap();
        (ledger, subscription)
    }

    fn scripted() -> Arc<ScriptedProcessor> {
        Arc::new(
            ScriptedProcessor::new()
                .with_subscription(remote_subscription("sub_1", SubscriptionStatus::Active)),
        )
    }

    #[tokio::test]
    async fn test_cancel_then_reactivate() {
        let (ledger, subscription) = seeded(SubscriptionStatus::Active).await;
        let processor = scripted();
        let service = SubscriptionService::new(ledger.clone(), processor.clone());

        let canceled = service.cancel_subscription(subscription.id).await.unwrap();
        assert!(canceled.cancel_at_period_end);
        assert_eq!(canceled.status, SubscriptionStatus::Active);
        assert!(processor.subscription("sub_1").await.unwrap().cancel_at_period_end);

        let resumed = service
            .reactivate_subscription(subscription.id)
            .await
            .unwrap();
        assert!(!resumed.cancel_at_period_end);

        let stored = ledger.find_subscription(subscription.id).await.unwrap().unwrap();
        assert!(!stored.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_not_found() {
        let (ledger, _) = seeded(SubscriptionStatus::Active).await;
        let service = SubscriptionService::new(ledger, scripted());

        let result = service.cancel_subscription(Uuid::new_v4()).await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reactivating_canceled_subscription_is_rejected() {
        let (ledger, subscription) = seeded(SubscriptionStatus::Canceled).await;
        let service = SubscriptionService::new(ledger, scripted());

        let result = service.reactivate_subscription(subscription.id).await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_processor_failure_leaves_row_untouched() {
        let (ledger, subscription) = seeded(SubscriptionStatus::Active).await;
        let service = SubscriptionService::new(ledger.clone(), Arc::new(FailingProcessor));

        let result = service.cancel_subscription(subscription.id).await;
        assert!(matches!(result, Err(BillingError::StripeApi(_))));

        let stored = ledger.find_subscription(subscription.id).await.unwrap().unwrap();
        assert!(!stored.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_database_error() {
        let (ledger, subscription) = seeded(SubscriptionStatus::Active).await;
        let service = SubscriptionService::new(ledger.clone(), scripted());
        ledger.set_fail_writes(true);

        let result = service.cancel_subscription(subscription.id).await;
        assert!(matches!(result, Err(BillingError::Database(_))));
    }

    #[test]
    fn test_merge_remote_keeps_missing_fields() {
        let stored = SubscriptionState {
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: time::OffsetDateTime::from_unix_timestamp(1_738_368_000).ok(),
            cancel_at_period_end: false,
            trial_start: None,
            trial_end: None,
            canceled_at: None,
            amount_cents: 4000,
            currency: "gbp".to_string(),
            interval: BillingInterval::Year,
        };
        let mut remote = remote_subscription("sub_1", SubscriptionStatus::Active);
        remote.cancel_at_period_end = true;
        remote.amount_cents = None;
        remote.currency = None;
        remote.interval = None;

        let merged = merge_remote(stored.clone(), &remote);
        assert!(merged.cancel_at_period_end);
        assert_eq!(merged.amount_cents, 4000);
        assert_eq!(merged.currency, "gbp");
        assert_eq!(merged.interval, BillingInterval::Year);
        assert_eq!(merged.current_period_end, stored.current_period_end);
    }
}
