// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DonorLedger Billing Module
//!
//! Keeps the local donation ledger consistent with Stripe.
//!
//! ## Features
//!
//! - **Webhooks**: Verify Stripe deliveries and upsert subscriptions and payments
//! - **Membership**: Derive a donor's overall standing from ledger and live data
//! - **Subscriptions**: Donor-initiated cancel and reactivate
//! - **Payments**: Customer creation and SetupIntents for collecting payment methods
//! - **Ledger**: Storage trait with Postgres and in-memory implementations

pub mod client;
pub mod error;
pub mod events;
pub mod ledger;
pub mod membership;
pub mod models;
pub mod payments;
pub mod processor;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


// Client
pub use client::{StripeClient, StripeConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, WebhookEvent};

// Ledger
pub use ledger::{DateRange, DonorLookup, Ledger, MemoryLedger, PgLedger};

// Membership
pub use membership::{
    overall_status, MembershipAggregator, MembershipQuery, MembershipReport, MembershipStatus,
    PaymentSummary, RemoteSnapshot, DEFAULT_REMOTE_TIMEOUT,
};

// Models
pub use models::{
    Donor, EventOutcome, Package, Subscription, SubscriptionTransaction, Transaction,
    WebhookEventRecord,
};

// Payments
pub use payments::PaymentSetupService;

// Processor
pub use processor::{
    PaymentProcessor, RemoteCustomer, RemoteInvoice, RemoteSubscription, SetupIntentSecret,
    StripeProcessor,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, WebhookReplayResult};

use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub payments: PaymentSetupService,
    pub processor: Arc<dyn PaymentProcessor>,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(ledger: Arc<dyn Ledger>) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, ledger))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, ledger: Arc<dyn Ledger>) -> Self {
        let processor: Arc<dyn PaymentProcessor> =
            Arc::new(StripeProcessor::new(StripeClient::new(config.clone())));
        Self::with_processor(&config, ledger, processor)
    }

    /// Create a billing service around an existing processor
    pub fn with_processor(
        config: &StripeConfig,
        ledger: Arc<dyn Ledger>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        Self {
            payments: PaymentSetupService::new(ledger.clone(), processor.clone()),
            subscriptions: SubscriptionService::new(ledger.clone(), processor.clone()),
            webhooks: WebhookHandler::new(config, ledger),
            processor,
        }
    }
}
