//! Stripe webhook handling
//!
//! Verifies signed deliveries and keeps the local subscription and
//! transaction ledger in step with the processor's event stream. Delivery
//! is at-least-once and unordered, so every handler looks its row up by
//! remote id and either creates it, corrects it forward or does nothing.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use donorledger_shared::{SubscriptionStatus, TransactionStatus};

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    ChargeObject, EventKind, InvoiceObject, PaymentIntentObject, Pricing, SubscriptionObject,
    WebhookEvent,
};
use crate::ledger::{DonorLookup, EventClaim, Ledger};
use crate::models::{
    EventOutcome, NewSubscription, NewSubscriptionTransaction, NewTransaction, PaymentCorrection,
    Subscription, SubscriptionState, WebhookEventRecord,
};

type HmacSha256 = Hmac<Sha256>;

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Handler ran and committed its changes
    Processed,
    /// Event id was already claimed
    Duplicate,
    /// Event was dropped because its metadata was missing or dangling
    Skipped,
    /// Event type has no handler
    Unhandled,
    /// Handler failed; the error is on the audit row
    Failed,
}

enum Dispatch {
    Handled,
    Unhandled,
}

/// Canceled is terminal at the processor, so a non-canceled state arriving
/// for a canceled row is an older delivery
fn is_stale_after_cancel(existing: &Subscription, incoming: &SubscriptionState) -> bool {
    existing.status == SubscriptionStatus::Canceled
        && incoming.status != SubscriptionStatus::Canceled
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    tolerance_secs: i64,
    ledger: Arc<dyn Ledger>,
}

impl WebhookHandler {
    pub fn new(config: &StripeConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            webhook_secret: config.webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
            ledger,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock, in unix seconds
    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        // Header format: t=timestamp,v1=signature[,v1=signature...][,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if now.abs_diff(timestamp) > self.tolerance_secs.max(0) as u64 {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event = WebhookEvent::parse(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse verified webhook payload");
            e
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// The event id is claimed atomically first, so concurrent or repeated
    /// deliveries run the handlers once. Handler failures are recorded on
    /// the audit row and reported through the outcome; only a failure to
    /// claim the event is returned as an error.
    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
        payload: &str,
    ) -> BillingResult<WebhookOutcome> {
        let claimed = self
            .ledger
            .claim_event(&EventClaim {
                stripe_event_id: &event.id,
                event_type: &event.event_type,
                payload,
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                e
            })?;

        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, already claimed"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Processing Stripe webhook event"
        );

        let (outcome, result, error_message) = self.run(event).await;
        self.record_result(&event.id, result, error_message.as_deref())
            .await;

        Ok(outcome)
    }

    /// Dispatch and classify the result for the audit row
    async fn run(&self, event: &WebhookEvent) -> (WebhookOutcome, EventOutcome, Option<String>) {
        match self.dispatch(event).await {
            Ok(Dispatch::Handled) => (WebhookOutcome::Processed, EventOutcome::Success, None),
            Ok(Dispatch::Unhandled) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Received unhandled Stripe event type"
                );
                (WebhookOutcome::Unhandled, EventOutcome::Success, None)
            }
            Err(e) if e.is_skippable() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %e,
                    "Skipping webhook event"
                );
                (
                    WebhookOutcome::Skipped,
                    EventOutcome::Skipped,
                    Some(e.to_string()),
                )
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                (
                    WebhookOutcome::Failed,
                    EventOutcome::Error,
                    Some(e.to_string()),
                )
            }
        }
    }

    async fn record_result(
        &self,
        stripe_event_id: &str,
        result: EventOutcome,
        error_message: Option<&str>,
    ) {
        let first = self
            .ledger
            .finish_event(stripe_event_id, result, error_message)
            .await;

        if let Err(e) = first {
            tracing::warn!(
                event_id = %stripe_event_id,
                error = %e,
                "First attempt to update webhook event failed, retrying"
            );

            if let Err(retry_err) = self
                .ledger
                .finish_event(stripe_event_id, result, error_message)
                .await
            {
                tracing::error!(
                    event_id = %stripe_event_id,
                    processing_result = result.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook audit record after retry; \
                     event stays in processing until the claim times out"
                );
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<Dispatch> {
        match event.kind() {
            EventKind::SubscriptionCreated => self.handle_subscription_created(event).await?,
            EventKind::SubscriptionUpdated => self.handle_subscription_updated(event).await?,
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(event).await?,
            EventKind::TrialWillEnd => self.handle_trial_will_end(event)?,
            EventKind::InvoicePaid => {
                self.record_invoice(event, TransactionStatus::Succeeded)
                    .await?
            }
            EventKind::InvoicePaymentFailed => {
                self.record_invoice(event, TransactionStatus::Failed).await?
            }
            EventKind::PaymentIntentSucceeded => {
                self.record_payment_intent(event, TransactionStatus::Succeeded)
                    .await?
            }
            EventKind::PaymentIntentFailed => {
                self.record_payment_intent(event, TransactionStatus::Failed)
                    .await?
            }
            EventKind::ChargeRefunded => self.handle_charge_refunded(event).await?,
            EventKind::Unknown => return Ok(Dispatch::Unhandled),
        }
        Ok(Dispatch::Handled)
    }

    async fn handle_subscription_created(&self, event: &WebhookEvent) -> BillingResult<()> {
        let subscription: SubscriptionObject = event.object()?;
        let donor_id = subscription.donor_id()?;
        let organization_id = subscription.organization_id()?;
        let package_id = subscription.package_id()?;

        let donor = self
            .ledger
            .find_donor(&DonorLookup::Id(donor_id))
            .await?
            .ok_or_else(|| BillingError::UnknownReference(format!("donor {}", donor_id)))?;
        let package = self
            .ledger
            .find_package(package_id)
            .await?
            .ok_or_else(|| BillingError::UnknownReference(format!("package {}", package_id)))?;
        if package.organization_id != organization_id {
            return Err(BillingError::UnknownReference(format!(
                "organization {} does not own package {}",
                organization_id, package_id
            )));
        }

        match self
            .ledger
            .find_subscription_by_remote_id(&subscription.id)
            .await?
        {
            Some(existing) => {
                let state = subscription.state(&Pricing::from(&existing))?;
                if is_stale_after_cancel(&existing, &state) {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        status = %state.status,
                        "Ignoring stale created event for canceled subscription"
                    );
                } else if existing.state() == state {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        "Subscription already recorded, nothing to change"
                    );
                } else {
                    self.ledger
                        .update_subscription_state(&subscription.id, &state)
                        .await?;
                    tracing::info!(
                        subscription_id = %subscription.id,
                        status = %state.status,
                        "Updated existing subscription from created event"
                    );
                }
            }
            None => {
                let state = subscription.state(&Pricing::from(&package))?;
                let created = self
                    .ledger
                    .insert_subscription(&NewSubscription {
                        stripe_subscription_id: subscription.id.clone(),
                        stripe_customer_id: subscription.customer_id().map(str::to_string),
                        donor_id: donor.id,
                        organization_id,
                        package_id: package.id,
                        state,
                    })
                    .await?;
                tracing::info!(
                    subscription_id = %subscription.id,
                    local_id = %created.id,
                    donor_id = %donor.id,
                    status = %created.status,
                    "Recorded new subscription"
                );
            }
        }

        if let (None, Some(customer_id)) =
            (donor.stripe_customer_id.as_deref(), subscription.customer_id())
        {
            self.ledger
                .set_donor_customer_id(donor.id, customer_id)
                .await?;
            tracing::info!(
                donor_id = %donor.id,
                customer_id = %customer_id,
                "Linked donor to Stripe customer"
            );
        }

        Ok(())
    }

    async fn handle_subscription_updated(&self, event: &WebhookEvent) -> BillingResult<()> {
        let subscription: SubscriptionObject = event.object()?;

        let Some(existing) = self
            .ledger
            .find_subscription_by_remote_id(&subscription.id)
            .await?
        else {
            tracing::debug!(
                subscription_id = %subscription.id,
                "Update for unknown subscription, ignoring"
            );
            return Ok(());
        };

        let state = subscription.state(&Pricing::from(&existing))?;
        if is_stale_after_cancel(&existing, &state) {
            tracing::warn!(
                subscription_id = %subscription.id,
                event_id = %event.id,
                status = %state.status,
                "Ignoring stale update for canceled subscription"
            );
            return Ok(());
        }
        if existing.state() == state {
            return Ok(());
        }

        self.ledger
            .update_subscription_state(&subscription.id, &state)
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            previous_status = %existing.status,
            status = %state.status,
            cancel_at_period_end = state.cancel_at_period_end,
            "Subscription updated"
        );
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<()> {
        let subscription: SubscriptionObject = event.object()?;

        let Some(existing) = self
            .ledger
            .find_subscription_by_remote_id(&subscription.id)
            .await?
        else {
            tracing::debug!(
                subscription_id = %subscription.id,
                "Deletion of unknown subscription, ignoring"
            );
            return Ok(());
        };

        let mut state = subscription.state(&Pricing::from(&existing))?;
        state.status = SubscriptionStatus::Canceled;
        state.canceled_at = state
            .canceled_at
            .or(existing.canceled_at)
            .or_else(|| Some(OffsetDateTime::now_utc()));

        if existing.state() != state {
            self.ledger
                .update_subscription_state(&subscription.id, &state)
                .await?;
        }

        tracing::info!(
            subscription_id = %subscription.id,
            donor_id = %existing.donor_id,
            "Subscription canceled"
        );
        Ok(())
    }

    fn handle_trial_will_end(&self, event: &WebhookEvent) -> BillingResult<()> {
        let subscription: SubscriptionObject = event.object()?;
        tracing::info!(
            subscription_id = %subscription.id,
            trial_end = ?subscription.trial_end,
            "Trial ending soon"
        );
        Ok(())
    }

    async fn record_invoice(
        &self,
        event: &WebhookEvent,
        status: TransactionStatus,
    ) -> BillingResult<()> {
        let invoice: InvoiceObject = event.object()?;

        let Some(remote_subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice is not for a subscription");
            return Ok(());
        };

        let Some(subscription) = self
            .ledger
            .find_subscription_by_remote_id(remote_subscription_id)
            .await?
        else {
            tracing::debug!(
                invoice_id = %invoice.id,
                subscription_id = %remote_subscription_id,
                "Invoice for unknown subscription, ignoring"
            );
            return Ok(());
        };

        let failed = status == TransactionStatus::Failed;
        let failure_reason = failed.then(|| invoice.failure_reason());
        let paid_at = if failed { None } else { invoice.paid_at() };
        let amount_cents = if failed {
            invoice.amount_due
        } else {
            invoice.amount_paid
        };

        let existing = match self.ledger.find_subscription_transaction(&invoice.id).await? {
            Some(row) => row,
            None => {
                let row = self
                    .ledger
                    .insert_subscription_transaction(&NewSubscriptionTransaction {
                        stripe_invoice_id: invoice.id.clone(),
                        stripe_payment_intent_id: invoice.payment_intent_id().map(str::to_string),
                        subscription_id: subscription.id,
                        donor_id: subscription.donor_id,
                        organization_id: subscription.organization_id,
                        amount_cents,
                        currency: invoice.currency.to_lowercase(),
                        status,
                        failure_reason: failure_reason.clone(),
                        attempt_count: invoice.attempt_count,
                        paid_at,
                    })
                    .await?;
                if row.status == status && row.attempt_count == invoice.attempt_count {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        subscription_id = %remote_subscription_id,
                        status = %status,
                        amount_cents = amount_cents,
                        "Recorded subscription payment"
                    );
                    return Ok(());
                }
                row
            }
        };

        let retried_failure = failed
            && existing.status == TransactionStatus::Failed
            && invoice.attempt_count > existing.attempt_count;

        if !existing.status.can_transition_to(status) && !retried_failure {
            tracing::debug!(
                invoice_id = %invoice.id,
                stored_status = %existing.status,
                event_status = %status,
                "Stale invoice event, keeping stored status"
            );
            return Ok(());
        }

        self.ledger
            .correct_subscription_transaction(
                existing.id,
                &PaymentCorrection {
                    status,
                    failure_reason,
                    attempt_count: Some(invoice.attempt_count),
                    paid_at,
                    stripe_payment_intent_id: invoice.payment_intent_id().map(str::to_string),
                },
            )
            .await?;

        tracing::info!(
            invoice_id = %invoice.id,
            previous_status = %existing.status,
            status = %status,
            attempt_count = invoice.attempt_count,
            "Corrected subscription payment"
        );
        Ok(())
    }

    async fn record_payment_intent(
        &self,
        event: &WebhookEvent,
        status: TransactionStatus,
    ) -> BillingResult<()> {
        let intent: PaymentIntentObject = event.object()?;

        if let Some(invoice_id) = intent.invoice_id() {
            tracing::debug!(
                payment_intent_id = %intent.id,
                invoice_id = %invoice_id,
                "Payment intent belongs to an invoice, recorded via invoice events"
            );
            return Ok(());
        }
        if self
            .ledger
            .find_subscription_transaction_by_payment_intent(&intent.id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let donor_id = intent.donor_id()?;
        let organization_id = intent.organization_id()?;
        if self
            .ledger
            .find_donor(&DonorLookup::Id(donor_id))
            .await?
            .is_none()
        {
            return Err(BillingError::UnknownReference(format!("donor {}", donor_id)));
        }
        match intent.package_id() {
            Some(package_id) => {
                let package = self.ledger.find_package(package_id).await?.ok_or_else(|| {
                    BillingError::UnknownReference(format!("package {}", package_id))
                })?;
                if package.organization_id != organization_id {
                    return Err(BillingError::UnknownReference(format!(
                        "organization {} does not own package {}",
                        organization_id, package_id
                    )));
                }
            }
            None => {
                if !self.ledger.organization_exists(organization_id).await? {
                    return Err(BillingError::UnknownReference(format!(
                        "organization {}",
                        organization_id
                    )));
                }
            }
        }

        let failed = status == TransactionStatus::Failed;
        let failure_reason = failed.then(|| intent.failure_reason());
        let amount_cents = if !failed && intent.amount_received > 0 {
            intent.amount_received
        } else {
            intent.amount
        };

        let existing = match self.ledger.find_transaction(&intent.id).await? {
            Some(row) => row,
            None => {
                let row = self
                    .ledger
                    .insert_transaction(&NewTransaction {
                        stripe_payment_intent_id: intent.id.clone(),
                        donor_id,
                        organization_id,
                        package_id: intent.package_id(),
                        amount_cents,
                        currency: intent.currency.to_lowercase(),
                        status,
                        failure_reason: failure_reason.clone(),
                    })
                    .await?;
                if row.status == status {
                    tracing::info!(
                        payment_intent_id = %intent.id,
                        donor_id = %donor_id,
                        status = %status,
                        amount_cents = amount_cents,
                        "Recorded one-off payment"
                    );
                    return Ok(());
                }
                row
            }
        };

        if !existing.status.can_transition_to(status) {
            tracing::debug!(
                payment_intent_id = %intent.id,
                stored_status = %existing.status,
                event_status = %status,
                "Stale payment intent event, keeping stored status"
            );
            return Ok(());
        }

        self.ledger
            .correct_transaction(
                existing.id,
                &PaymentCorrection {
                    status,
                    failure_reason,
                    attempt_count: None,
                    paid_at: None,
                    stripe_payment_intent_id: None,
                },
            )
            .await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            previous_status = %existing.status,
            status = %status,
            "Corrected one-off payment"
        );
        Ok(())
    }

    async fn handle_charge_refunded(&self, event: &WebhookEvent) -> BillingResult<()> {
        let charge: ChargeObject = event.object()?;

        if !charge.refunded {
            tracing::info!(
                charge_id = %charge.id,
                amount_refunded = charge.amount_refunded,
                amount = charge.amount,
                "Partial refund, ledger status unchanged"
            );
            return Ok(());
        }

        let refund = PaymentCorrection {
            status: TransactionStatus::Refunded,
            failure_reason: None,
            attempt_count: None,
            paid_at: None,
            stripe_payment_intent_id: None,
        };

        let subscription_row = match (charge.invoice_id(), charge.payment_intent_id()) {
            (Some(invoice_id), _) => self.ledger.find_subscription_transaction(invoice_id).await?,
            (None, Some(pi)) => {
                self.ledger
                    .find_subscription_transaction_by_payment_intent(pi)
                    .await?
            }
            (None, None) => None,
        };

        if let Some(row) = subscription_row {
            if row.status.can_transition_to(TransactionStatus::Refunded) {
                self.ledger
                    .correct_subscription_transaction(row.id, &refund)
                    .await?;
                tracing::info!(
                    charge_id = %charge.id,
                    invoice_id = %row.stripe_invoice_id,
                    "Subscription payment refunded"
                );
            }
            return Ok(());
        }

        let Some(pi) = charge.payment_intent_id() else {
            tracing::debug!(charge_id = %charge.id, "Refunded charge has no payment intent");
            return Ok(());
        };

        match self.ledger.find_transaction(pi).await? {
            Some(row) if row.status.can_transition_to(TransactionStatus::Refunded) => {
                self.ledger.correct_transaction(row.id, &refund).await?;
                tracing::info!(
                    charge_id = %charge.id,
                    payment_intent_id = %pi,
                    "One-off payment refunded"
                );
            }
            Some(_) => {}
            None => {
                tracing::debug!(
                    charge_id = %charge.id,
                    payment_intent_id = %pi,
                    "Refund for unknown payment, ignoring"
                );
            }
        }
        Ok(())
    }

    /// List recorded webhook events with optional result filter
    pub async fn list_webhooks(
        &self,
        status_filter: Option<EventOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.ledger.list_events(status_filter, limit, offset).await
    }

    /// Re-run the handlers for a recorded event from its stored payload
    pub async fn replay_webhook(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Attempting to replay webhook event"
        );

        let record = self
            .ledger
            .find_event(stripe_event_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Webhook event {} not found in database",
                    stripe_event_id
                ))
            })?;

        let event = WebhookEvent::parse(&record.payload)?;
        self.ledger.restart_event(stripe_event_id).await?;

        let (outcome, result, error_message) = self.run(&event).await;
        self.ledger
            .finish_event(stripe_event_id, result, error_message.as_deref())
            .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %record.processing_result,
            new_status = result.as_str(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            stripe_event_id: record.stripe_event_id,
            event_type: record.event_type,
            previous_status: record.processing_result,
            previous_error: record.error_message,
            new_status: result.as_str().to_string(),
            new_error: error_message,
            outcome,
        })
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub outcome: WebhookOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{Donor, Package};
    use crate::testing::{
        donor, event_payload, invoice_object, package, sign_payload, subscription_object,
        TEST_WEBHOOK_SECRET,
    };
    use serde_json::json;

    const NOW: i64 = 1_735_689_600;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        handler: WebhookHandler,
        donor: Donor,
        package: Package,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let organization_id = Uuid::new_v4();
        let donor = donor(organization_id, "donor@example.com");
        let package = package(organization_id);
        ledger.insert_donor(donor.clone()).await;
        ledger.insert_package(package.clone()).await;

        let config = StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
            webhook_tolerance_secs: 300,
            api_base: None,
        };
        let handler = WebhookHandler::new(&config, ledger.clone());

        Fixture {
            ledger,
            handler,
            donor,
            package,
        }
    }

    impl Fixture {
        async fn deliver(&self, payload: &str) -> WebhookOutcome {
            let signature = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW);
            let event = self
                .handler
                .verify_event_at(payload, &signature, NOW)
                .unwrap();
            self.handler.handle_event(&event, payload).await.unwrap()
        }

        fn subscription(&self, remote_id: &str, status: &str) -> serde_json::Value {
            subscription_object(remote_id, status, &self.donor, &self.package)
        }

        async fn create_subscription(&self, remote_id: &str) {
            let payload = event_payload(
                &format!("evt_create_{}", remote_id),
                "customer.subscription.created",
                self.subscription(remote_id, "active"),
            );
            assert_eq!(self.deliver(&payload).await, WebhookOutcome::Processed);
        }
    }

    // Signature verification

    #[tokio::test]
    async fn test_verify_accepts_valid_signature() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let signature = sign_payload(TEST_WEBHOOK_SECRET, &payload, NOW);

        let event = f.handler.verify_event_at(&payload, &signature, NOW).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind(), EventKind::InvoicePaid);
    }

    #[tokio::test]
    async fn test_verify_accepts_any_v1_entry() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let valid = sign_payload(TEST_WEBHOOK_SECRET, &payload, NOW);
        let v1 = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={},v0=abc", NOW, "00".repeat(32), v1);

        assert!(f.handler.verify_event_at(&payload, &header, NOW).is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_payload() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let signature = sign_payload(TEST_WEBHOOK_SECRET, &payload, NOW);
        let tampered = payload.replace("in_1", "in_2");

        let result = f.handler.verify_event_at(&tampered, &signature, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_secret() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let signature = sign_payload("whsec_other", &payload, NOW);

        let result = f.handler.verify_event_at(&payload, &signature, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_rejects_stale_timestamp() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let signature = sign_payload(TEST_WEBHOOK_SECRET, &payload, NOW - 301);

        let result = f.handler.verify_event_at(&payload, &signature, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_headers() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "invoice.paid", json!({"id": "in_1"}));

        let timestamp_only = format!("t={}", NOW);
        let earliest = format!("t={},v1=00", i64::MIN);
        let latest = format!("t={},v1=00", i64::MAX);
        for header in [
            "",
            "garbage",
            "t=abc,v1=00",
            timestamp_only.as_str(),
            "v1=deadbeef",
            earliest.as_str(),
            latest.as_str(),
        ] {
            let result = f.handler.verify_event_at(&payload, header, NOW);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[tokio::test]
    async fn test_verify_rejects_unparsable_body() {
        let f = fixture().await;
        let payload = r#"{"not":"an event"}"#;
        let signature = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW);

        let result = f.handler.verify_event_at(payload, &signature, NOW);
        assert!(matches!(result, Err(BillingError::WebhookPayload(_))));
        assert_eq!(f.ledger.write_count().await, 0);
    }

    // Subscriptions

    #[tokio::test]
    async fn test_subscription_created_twice_keeps_one_row() {
        let f = fixture().await;
        let object = f.subscription("sub_1", "active");

        let first = event_payload("evt_1", "customer.subscription.created", object.clone());
        let second = event_payload("evt_2", "customer.subscription.created", object);
        assert_eq!(f.deliver(&first).await, WebhookOutcome::Processed);
        assert_eq!(f.deliver(&second).await, WebhookOutcome::Processed);

        assert_eq!(f.ledger.subscription_count().await, 1);
        let row = f
            .ledger
            .find_subscription_by_remote_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.donor_id, f.donor.id);
        assert_eq!(row.package_id, f.package.id);
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert_eq!(row.amount_cents, 2500);
    }

    #[tokio::test]
    async fn test_subscription_created_links_customer_to_donor() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let donor = f
            .ledger
            .find_donor(&DonorLookup::Id(f.donor.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(donor.stripe_customer_id.as_deref(), Some("cus_test"));
    }

    #[tokio::test]
    async fn test_subscription_created_without_metadata_is_skipped() {
        let f = fixture().await;
        let mut object = f.subscription("sub_1", "active");
        object["metadata"] = json!({ "donor_id": f.donor.id.to_string() });

        let payload = event_payload("evt_1", "customer.subscription.created", object);
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.subscription_count().await, 0);

        let record = f.ledger.find_event("evt_1").await.unwrap().unwrap();
        assert_eq!(record.processing_result, "skipped");
        assert!(record.error_message.unwrap().contains("organization_id"));
    }

    #[tokio::test]
    async fn test_subscription_created_for_unknown_donor_is_skipped() {
        let f = fixture().await;
        let mut object = f.subscription("sub_1", "active");
        object["metadata"]["donor_id"] = json!(Uuid::new_v4().to_string());

        let payload = event_payload("evt_1", "customer.subscription.created", object);
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_skipped_event_does_not_affect_the_next() {
        let f = fixture().await;
        let mut broken = f.subscription("sub_1", "active");
        broken["metadata"] = json!({});

        let first = event_payload("evt_1", "customer.subscription.created", broken);
        let second = event_payload(
            "evt_2",
            "customer.subscription.created",
            f.subscription("sub_2", "active"),
        );
        assert_eq!(f.deliver(&first).await, WebhookOutcome::Skipped);
        assert_eq!(f.deliver(&second).await, WebhookOutcome::Processed);
        assert_eq!(f.ledger.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscription_updated_for_unknown_id_creates_nothing() {
        let f = fixture().await;
        let payload = event_payload(
            "evt_1",
            "customer.subscription.updated",
            f.subscription("sub_unknown", "active"),
        );

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        assert_eq!(f.ledger.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_updated_changes_mutable_fields() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let mut object = f.subscription("sub_1", "past_due");
        object["cancel_at_period_end"] = json!(true);
        let payload = event_payload("evt_2", "customer.subscription.updated", object);
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);

        let row = f
            .ledger
            .find_subscription_by_remote_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::PastDue);
        assert!(row.cancel_at_period_end);
        assert_eq!(row.donor_id, f.donor.id);
    }

    #[tokio::test]
    async fn test_subscription_updated_normalizes_remote_status() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let payload = event_payload(
            "evt_2",
            "customer.subscription.updated",
            f.subscription("sub_1", "paused"),
        );
        f.deliver(&payload).await;

        let row = f
            .ledger
            .find_subscription_by_remote_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_subscription_deleted_marks_canceled() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let payload = event_payload(
            "evt_2",
            "customer.subscription.deleted",
            f.subscription("sub_1", "active"),
        );
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);

        let row = f
            .ledger
            .find_subscription_by_remote_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert!(row.canceled_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_created_after_delete_keeps_canceled() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;
        f.deliver(&event_payload(
            "evt_2",
            "customer.subscription.deleted",
            f.subscription("sub_1", "canceled"),
        ))
        .await;

        let late = event_payload(
            "evt_3",
            "customer.subscription.created",
            f.subscription("sub_1", "active"),
        );
        assert_eq!(f.deliver(&late).await, WebhookOutcome::Processed);

        let row = f
            .ledger
            .find_subscription_by_remote_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_subscription_created_for_foreign_organization_is_skipped() {
        let f = fixture().await;
        let mut object = f.subscription("sub_1", "active");
        object["metadata"]["organization_id"] = json!(Uuid::new_v4().to_string());
        let payload = event_payload("evt_1", "customer.subscription.created", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_deleted_for_unknown_id_is_noop() {
        let f = fixture().await;
        let payload = event_payload(
            "evt_1",
            "customer.subscription.deleted",
            f.subscription("sub_unknown", "canceled"),
        );

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        assert_eq!(f.ledger.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_recorded_not_raised() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let payload = event_payload(
            "evt_2",
            "customer.subscription.updated",
            f.subscription("sub_1", "frozen"),
        );
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Failed);

        let record = f.ledger.find_event("evt_2").await.unwrap().unwrap();
        assert_eq!(record.processing_result, "error");
        assert!(record.error_message.is_some());
    }

    // Event idempotency

    #[tokio::test]
    async fn test_duplicate_event_runs_handlers_once() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let payload = event_payload(
            "evt_invoice",
            "invoice.paid",
            invoice_object("in_1", "sub_1", 2500),
        );
        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        let writes = f.ledger.write_count().await;

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Duplicate);
        assert_eq!(f.ledger.write_count().await, writes);
        assert_eq!(f.ledger.subscription_transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let f = fixture().await;
        let payload = event_payload("evt_1", "customer.created", json!({"id": "cus_1"}));

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Unhandled);
        let record = f.ledger.find_event("evt_1").await.unwrap().unwrap();
        assert_eq!(record.processing_result, "success");
    }

    // Invoices

    #[tokio::test]
    async fn test_invoice_paid_once_per_invoice() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        for (event_id, event_type) in [
            ("evt_a", "invoice.payment_succeeded"),
            ("evt_b", "invoice.paid"),
            ("evt_c", "invoice.paid"),
        ] {
            let payload =
                event_payload(event_id, event_type, invoice_object("in_1", "sub_1", 2500));
            assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        }

        assert_eq!(f.ledger.subscription_transaction_count().await, 1);
        let row = f
            .ledger
            .find_subscription_transaction("in_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Succeeded);
        assert_eq!(row.amount_cents, 2500);
        assert!(row.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_invoice_failed_then_paid_ends_succeeded() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let failed = event_payload(
            "evt_fail",
            "invoice.payment_failed",
            invoice_object("in_1", "sub_1", 2500),
        );
        let paid = event_payload(
            "evt_paid",
            "invoice.paid",
            invoice_object("in_1", "sub_1", 2500),
        );
        f.deliver(&failed).await;
        f.deliver(&paid).await;

        let row = f
            .ledger
            .find_subscription_transaction("in_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Succeeded);
        assert!(row.failure_reason.is_none());
        assert_eq!(f.ledger.subscription_transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_invoice_paid_then_stale_failure_stays_succeeded() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let paid = event_payload(
            "evt_paid",
            "invoice.paid",
            invoice_object("in_1", "sub_1", 2500),
        );
        let failed = event_payload(
            "evt_fail",
            "invoice.payment_failed",
            invoice_object("in_1", "sub_1", 2500),
        );
        f.deliver(&paid).await;
        f.deliver(&failed).await;

        let row = f
            .ledger
            .find_subscription_transaction("in_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_repeated_invoice_failure_updates_attempt_count() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;

        let first = event_payload(
            "evt_1",
            "invoice.payment_failed",
            invoice_object("in_1", "sub_1", 2500),
        );
        let mut retry = invoice_object("in_1", "sub_1", 2500);
        retry["attempt_count"] = json!(3);
        let second = event_payload("evt_2", "invoice.payment_failed", retry);
        f.deliver(&first).await;
        f.deliver(&second).await;

        let row = f
            .ledger
            .find_subscription_transaction("in_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(row.attempt_count, 3);
        assert!(row.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_invoice_for_unknown_subscription_is_noop() {
        let f = fixture().await;
        let payload = event_payload(
            "evt_1",
            "invoice.paid",
            invoice_object("in_1", "sub_unknown", 2500),
        );

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        assert_eq!(f.ledger.subscription_transaction_count().await, 0);
    }

    // One-off payments and refunds

    fn payment_intent(f: &Fixture, id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "object": "payment_intent",
            "amount": 5000,
            "amount_received": 5000,
            "currency": "usd",
            "metadata": {
                "donor_id": f.donor.id.to_string(),
                "organization_id": f.package.organization_id.to_string(),
            }
        })
    }

    #[tokio::test]
    async fn test_payment_intent_succeeded_records_transaction() {
        let f = fixture().await;
        let payload = event_payload(
            "evt_1",
            "payment_intent.succeeded",
            payment_intent(&f, "pi_1"),
        );

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        let row = f.ledger.find_transaction("pi_1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Succeeded);
        assert_eq!(row.amount_cents, 5000);
        assert_eq!(row.donor_id, f.donor.id);
        assert!(row.package_id.is_none());
    }

    #[tokio::test]
    async fn test_payment_intent_for_invoice_is_ignored() {
        let f = fixture().await;
        let mut object = payment_intent(&f, "pi_1");
        object["invoice"] = json!("in_1");
        let payload = event_payload("evt_1", "payment_intent.succeeded", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Processed);
        assert_eq!(f.ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_payment_intent_without_donor_is_skipped() {
        let f = fixture().await;
        let mut object = payment_intent(&f, "pi_1");
        object["metadata"] = json!({});
        let payload = event_payload("evt_1", "payment_intent.payment_failed", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_payment_intent_for_unknown_organization_is_skipped() {
        let f = fixture().await;
        let mut object = payment_intent(&f, "pi_1");
        object["metadata"]["organization_id"] = json!(Uuid::new_v4().to_string());
        let payload = event_payload("evt_1", "payment_intent.succeeded", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_payment_intent_package_from_other_organization_is_skipped() {
        let f = fixture().await;
        let other_organization = Uuid::new_v4();
        f.ledger.insert_organization(other_organization).await;

        let mut object = payment_intent(&f, "pi_1");
        object["metadata"]["organization_id"] = json!(other_organization.to_string());
        object["metadata"]["package_id"] = json!(f.package.id.to_string());
        let payload = event_payload("evt_1", "payment_intent.succeeded", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);
        assert_eq!(f.ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_charge_refunded_corrects_transaction() {
        let f = fixture().await;
        let paid = event_payload(
            "evt_1",
            "payment_intent.succeeded",
            payment_intent(&f, "pi_1"),
        );
        f.deliver(&paid).await;

        let refund = event_payload(
            "evt_2",
            "charge.refunded",
            json!({ "id": "ch_1", "payment_intent": "pi_1", "refunded": true, "amount": 5000, "amount_refunded": 5000 }),
        );
        assert_eq!(f.deliver(&refund).await, WebhookOutcome::Processed);

        let row = f.ledger.find_transaction("pi_1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_charge_refunded_corrects_subscription_payment() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;
        let paid = event_payload(
            "evt_paid",
            "invoice.paid",
            invoice_object("in_1", "sub_1", 2500),
        );
        f.deliver(&paid).await;

        // invoice_object uses pi_<invoice id>
        let refund = event_payload(
            "evt_refund",
            "charge.refunded",
            json!({ "id": "ch_1", "payment_intent": "pi_in_1", "refunded": true }),
        );
        f.deliver(&refund).await;

        let row = f
            .ledger
            .find_subscription_transaction("in_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_partial_refund_keeps_status() {
        let f = fixture().await;
        let paid = event_payload(
            "evt_1",
            "payment_intent.succeeded",
            payment_intent(&f, "pi_1"),
        );
        f.deliver(&paid).await;

        let refund = event_payload(
            "evt_2",
            "charge.refunded",
            json!({ "id": "ch_1", "payment_intent": "pi_1", "refunded": false, "amount": 5000, "amount_refunded": 1000 }),
        );
        f.deliver(&refund).await;

        let row = f.ledger.find_transaction("pi_1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Succeeded);
    }

    // Administration

    #[tokio::test]
    async fn test_replay_reprocesses_stored_payload() {
        let f = fixture().await;
        let stranger = donor(f.package.organization_id, "late@example.com");
        let object = subscription_object("sub_1", "active", &stranger, &f.package);
        let payload = event_payload("evt_1", "customer.subscription.created", object);

        assert_eq!(f.deliver(&payload).await, WebhookOutcome::Skipped);

        f.ledger.insert_donor(stranger).await;
        let result = f.handler.replay_webhook("evt_1").await.unwrap();

        assert_eq!(result.previous_status, "skipped");
        assert_eq!(result.new_status, "success");
        assert_eq!(result.outcome, WebhookOutcome::Processed);
        assert_eq!(f.ledger.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_replay_unknown_event_is_not_found() {
        let f = fixture().await;
        let result = f.handler.replay_webhook("evt_missing").await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_webhooks_filters_by_result() {
        let f = fixture().await;
        f.create_subscription("sub_1").await;
        let mut broken = f.subscription("sub_2", "active");
        broken["metadata"] = json!({});
        f.deliver(&event_payload(
            "evt_broken",
            "customer.subscription.created",
            broken,
        ))
        .await;

        let skipped = f
            .handler
            .list_webhooks(Some(EventOutcome::Skipped), 50, 0)
            .await
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].stripe_event_id, "evt_broken");

        let all = f.handler.list_webhooks(None, 50, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
