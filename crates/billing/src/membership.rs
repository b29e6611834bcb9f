//! Membership status aggregation
//!
//! Combines the donor's local subscriptions and payments with live
//! processor data into one report. The processor is consulted on a best
//! effort basis: any failure or timeout leaves `remote` empty and the
//! report is built from the ledger alone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use donorledger_shared::{SubscriptionStatus, TransactionStatus};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{DateRange, DonorLookup, Ledger};
use crate::models::{Donor, Subscription, SubscriptionTransaction, Transaction};
use crate::processor::{
    PaymentProcessor, RemoteCustomer, RemoteInvoice, RemoteSubscription, RECENT_INVOICE_LIMIT,
};

/// Default bound on processor calls made while building a report
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall standing of a donor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    Active,
    Trialing,
    ScheduledForCancellation,
    Canceled,
    Inactive,
}

/// The two fields of a subscription that decide membership status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInput {
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
}

impl From<&Subscription> for StatusInput {
    fn from(subscription: &Subscription) -> Self {
        Self {
            status: subscription.status,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

impl From<&RemoteSubscription> for StatusInput {
    fn from(subscription: &RemoteSubscription) -> Self {
        Self {
            status: subscription.status,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

/// Derive the overall status. First match wins:
///
/// 1. an `active` subscription and nothing active-like scheduled to cancel
/// 2. an active-like subscription in trial
/// 3. an active-like subscription scheduled to cancel
/// 4. nothing active-like, but something canceled
/// 5. inactive
pub fn overall_status(subscriptions: &[StatusInput]) -> MembershipStatus {
    let active_like: Vec<&StatusInput> = subscriptions
        .iter()
        .filter(|s| s.status.is_active_like())
        .collect();
    let scheduled = active_like.iter().any(|s| s.cancel_at_period_end);

    if !scheduled
        && active_like
            .iter()
            .any(|s| s.status == SubscriptionStatus::Active)
    {
        MembershipStatus::Active
    } else if active_like
        .iter()
        .any(|s| s.status == SubscriptionStatus::Trialing)
    {
        MembershipStatus::Trialing
    } else if scheduled {
        MembershipStatus::ScheduledForCancellation
    } else if subscriptions
        .iter()
        .any(|s| s.status == SubscriptionStatus::Canceled)
    {
        MembershipStatus::Canceled
    } else {
        MembershipStatus::Inactive
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    pub donor: DonorLookup,
    /// List non active-like subscriptions too (status is unaffected)
    pub include_inactive: bool,
    pub range: DateRange,
}

/// Totals over the payments in a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentSummary {
    /// Succeeded amount per lowercase currency code
    pub total_succeeded: BTreeMap<String, i64>,
    pub succeeded_count: usize,
    pub failed_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
}

impl PaymentSummary {
    fn add(&mut self, status: TransactionStatus, amount_cents: i64, currency: &str, at: OffsetDateTime) {
        match status {
            TransactionStatus::Succeeded => {
                *self
                    .total_succeeded
                    .entry(currency.to_lowercase())
                    .or_insert(0) += amount_cents;
                self.succeeded_count += 1;
                if self.last_payment_at.map_or(true, |last| at > last) {
                    self.last_payment_at = Some(at);
                }
            }
            TransactionStatus::Failed => self.failed_count += 1,
            TransactionStatus::Pending | TransactionStatus::Refunded => {}
        }
    }

    pub fn from_payments(
        transactions: &[Transaction],
        subscription_transactions: &[SubscriptionTransaction],
    ) -> Self {
        let mut summary = Self::default();
        for t in transactions {
            summary.add(t.status, t.amount_cents, &t.currency, t.created_at);
        }
        for t in subscription_transactions {
            summary.add(
                t.status,
                t.amount_cents,
                &t.currency,
                t.paid_at.unwrap_or(t.created_at),
            );
        }
        summary
    }
}

/// Live processor data for the donor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteSnapshot {
    pub customer: Option<RemoteCustomer>,
    pub subscriptions: Vec<RemoteSubscription>,
    pub invoices: Vec<RemoteInvoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipReport {
    pub donor: Donor,
    pub status: MembershipStatus,
    pub subscriptions: Vec<Subscription>,
    pub transactions: Vec<Transaction>,
    pub subscription_transactions: Vec<SubscriptionTransaction>,
    pub summary: PaymentSummary,
    pub remote: Option<RemoteSnapshot>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// Status inputs with live data taking precedence over the local mirror
fn merged_inputs(local: &[Subscription], remote: Option<&RemoteSnapshot>) -> Vec<StatusInput> {
    let live: HashMap<&str, &RemoteSubscription> = remote
        .map(|r| r.subscriptions.iter().map(|s| (s.id.as_str(), s)).collect())
        .unwrap_or_default();

    let mut inputs: Vec<StatusInput> = local
        .iter()
        .map(|s| match live.get(s.stripe_subscription_id.as_str()) {
            Some(remote) => StatusInput::from(*remote),
            None => StatusInput::from(s),
        })
        .collect();

    if let Some(remote) = remote {
        inputs.extend(
            remote
                .subscriptions
                .iter()
                .filter(|r| !local.iter().any(|s| s.stripe_subscription_id == r.id))
                .map(StatusInput::from),
        );
    }
    inputs
}

pub struct MembershipAggregator {
    ledger: Arc<dyn Ledger>,
    processor: Option<Arc<dyn PaymentProcessor>>,
    remote_timeout: Duration,
}

impl MembershipAggregator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        processor: Option<Arc<dyn PaymentProcessor>>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            processor,
            remote_timeout,
        }
    }

    pub async fn membership(&self, query: &MembershipQuery) -> BillingResult<MembershipReport> {
        let donor = self
            .ledger
            .find_donor(&query.donor)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Donor with {}", query.donor)))?;

        let subscriptions = self.ledger.list_donor_subscriptions(donor.id).await?;
        let transactions = self
            .ledger
            .list_donor_transactions(donor.id, &query.range)
            .await?;
        let subscription_transactions = self
            .ledger
            .list_donor_subscription_transactions(donor.id, &query.range)
            .await?;

        let remote = self.fetch_remote(&donor).await;
        let status = overall_status(&merged_inputs(&subscriptions, remote.as_ref()));
        let summary = PaymentSummary::from_payments(&transactions, &subscription_transactions);

        let subscriptions = if query.include_inactive {
            subscriptions
        } else {
            subscriptions
                .into_iter()
                .filter(|s| s.status.is_active_like())
                .collect()
        };

        tracing::debug!(
            donor_id = %donor.id,
            status = ?status,
            remote = remote.is_some(),
            "Built membership report"
        );

        Ok(MembershipReport {
            donor,
            status,
            subscriptions,
            transactions,
            subscription_transactions,
            summary,
            remote,
            generated_at: OffsetDateTime::now_utc(),
        })
    }

    async fn fetch_remote(&self, donor: &Donor) -> Option<RemoteSnapshot> {
        let processor = self.processor.as_ref()?;

        match tokio::time::timeout(self.remote_timeout, Self::load_remote(processor.as_ref(), donor))
            .await
        {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                tracing::warn!(
                    donor_id = %donor.id,
                    error = %e,
                    "Remote lookup failed, using local data only"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    donor_id = %donor.id,
                    timeout_ms = self.remote_timeout.as_millis() as u64,
                    "Remote lookup timed out, using local data only"
                );
                None
            }
        }
    }

    async fn load_remote(
        processor: &dyn PaymentProcessor,
        donor: &Donor,
    ) -> BillingResult<RemoteSnapshot> {
        let Some(customer) = processor
            .find_customer(donor.stripe_customer_id.as_deref(), &donor.email)
            .await?
        else {
            return Ok(RemoteSnapshot::default());
        };

        let (subscriptions, invoices) = tokio::try_join!(
            processor.list_subscriptions(&customer.id),
            processor.list_invoices(&customer.id, RECENT_INVOICE_LIMIT),
        )?;

        Ok(RemoteSnapshot {
            customer: Some(customer),
            subscriptions,
            invoices,
        })
    }
}
