//! Remote payment processor
//!
//! The aggregator, the subscription actions and payment setup reach Stripe
//! through [`PaymentProcessor`] so they can run against a scripted
//! processor in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use donorledger_shared::{BillingInterval, SubscriptionStatus};
use serde::Serialize;
use stripe::{
    CreateCustomer, CreateSetupIntent, Customer, CustomerId, Invoice, ListCustomers,
    ListInvoices, ListSubscriptions, SetupIntent, Subscription, SubscriptionId,
    SubscriptionStatusFilter, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{InvoiceObject, SubscriptionObject};
use crate::models::Donor;

/// Number of recent invoices fetched for a membership report
pub const RECENT_INVOICE_LIMIT: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Live subscription state as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<BillingInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInvoice {
    pub id: String,
    pub subscription_id: Option<String>,
    pub status: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
}

/// Credentials a client needs to collect a payment method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupIntentSecret {
    pub setup_intent_id: String,
    pub client_secret: String,
    pub customer_id: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Look up a customer by id, falling back to the first customer with this email
    async fn find_customer(
        &self,
        customer_id: Option<&str>,
        email: &str,
    ) -> BillingResult<Option<RemoteCustomer>>;

    /// All subscriptions of a customer, in any status
    async fn list_subscriptions(&self, customer_id: &str)
        -> BillingResult<Vec<RemoteSubscription>>;

    async fn list_invoices(&self, customer_id: &str, limit: u64)
        -> BillingResult<Vec<RemoteInvoice>>;

    /// Schedule (or unschedule) cancellation at the end of the current period
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<RemoteSubscription>;

    async fn create_customer(&self, donor: &Donor) -> BillingResult<RemoteCustomer>;

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret>;
}

/// [`PaymentProcessor`] backed by the Stripe API
pub struct StripeProcessor {
    stripe: StripeClient,
}

impl StripeProcessor {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn customer_id(raw: &str) -> BillingResult<CustomerId> {
        raw.parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
    }

    fn remote_customer(customer: &Customer) -> RemoteCustomer {
        RemoteCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            name: customer.name.clone(),
        }
    }

    /// Convert through our own payload type so both webhook and API data
    /// share one mapping
    fn remote_subscription(subscription: &Subscription) -> BillingResult<RemoteSubscription> {
        let object: SubscriptionObject =
            serde_json::from_value(serde_json::to_value(subscription)?)?;
        object.remote()
    }

    fn remote_invoice(invoice: &Invoice) -> BillingResult<RemoteInvoice> {
        let object: InvoiceObject = serde_json::from_value(serde_json::to_value(invoice)?)?;
        Ok(object.remote())
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn find_customer(
        &self,
        customer_id: Option<&str>,
        email: &str,
    ) -> BillingResult<Option<RemoteCustomer>> {
        if let Some(raw) = customer_id {
            let id = Self::customer_id(raw)?;
            let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;
            if !customer.deleted {
                return Ok(Some(Self::remote_customer(&customer)));
            }
            tracing::debug!(customer_id = %raw, "Stored customer is deleted, searching by email");
        }

        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = Customer::list(self.stripe.inner(), &params).await?;
        Ok(customers.data.first().map(Self::remote_customer))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(Self::customer_id(customer_id)?);
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(100);

        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;
        subscriptions
            .data
            .iter()
            .map(Self::remote_subscription)
            .collect()
    }

    async fn list_invoices(
        &self,
        customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<RemoteInvoice>> {
        let mut params = ListInvoices::new();
        params.customer = Some(Self::customer_id(customer_id)?);
        params.limit = Some(limit);

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;
        invoices.data.iter().map(Self::remote_invoice).collect()
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<RemoteSubscription> {
        let id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);

        let subscription = Subscription::update(self.stripe.inner(), &id, params).await?;
        Self::remote_subscription(&subscription)
    }

    async fn create_customer(&self, donor: &Donor) -> BillingResult<RemoteCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert("donor_id".to_string(), donor.id.to_string());
        if let Some(org_id) = donor.organization_id {
            metadata.insert("organization_id".to_string(), org_id.to_string());
        }

        let mut params = CreateCustomer::new();
        params.email = Some(&donor.email);
        params.name = donor.name.as_deref();
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            donor_id = %donor.id,
            customer_id = %customer.id,
            "Created Stripe customer for donor"
        );

        Ok(Self::remote_customer(&customer))
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret> {
        let mut params = CreateSetupIntent::new();
        params.customer = Some(Self::customer_id(customer_id)?);

        let intent = SetupIntent::create(self.stripe.inner(), params).await?;
        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            BillingError::StripeApi(format!("SetupIntent {} has no client secret", intent.id))
        })?;

        Ok(SetupIntentSecret {
            setup_intent_id: intent.id.to_string(),
            client_secret,
            customer_id: customer_id.to_string(),
        })
    }
}
