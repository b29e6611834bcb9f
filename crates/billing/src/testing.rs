//! Fixtures and fake processors for tests in this crate and the API crate

use std::time::Duration;

use async_trait::async_trait;
use donorledger_shared::{BillingInterval, SubscriptionStatus};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Donor, Package};
use crate::processor::{
    PaymentProcessor, RemoteCustomer, RemoteInvoice, RemoteSubscription, SetupIntentSecret,
};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Build a `Stripe-Signature` header for `payload`
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

pub fn event_payload(event_id: &str, event_type: &str, object: Value) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "livemode": false,
        "data": { "object": object }
    })
    .to_string()
}

pub fn donor(organization_id: Uuid, email: &str) -> Donor {
    Donor {
        id: Uuid::new_v4(),
        organization_id: Some(organization_id),
        email: email.to_string(),
        name: Some("Test Donor".to_string()),
        stripe_customer_id: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

pub fn package(organization_id: Uuid) -> Package {
    Package {
        id: Uuid::new_v4(),
        organization_id,
        name: "Monthly supporter".to_string(),
        amount_cents: 2500,
        currency: "usd".to_string(),
        interval: BillingInterval::Month,
    }
}

/// A remote subscription object carrying the metadata the ledger requires
pub fn subscription_object(remote_id: &str, status: &str, donor: &Donor, package: &Package) -> Value {
    json!({
        "id": remote_id,
        "object": "subscription",
        "customer": "cus_test",
        "status": status,
        "cancel_at_period_end": false,
        "current_period_start": 1_735_689_600,
        "current_period_end": 1_738_368_000,
        "metadata": {
            "donor_id": donor.id.to_string(),
            "organization_id": package.organization_id.to_string(),
            "package_id": package.id.to_string(),
        },
        "items": { "data": [{
            "quantity": 1,
            "price": {
                "unit_amount": package.amount_cents,
                "currency": package.currency,
                "recurring": { "interval": package.interval.as_str() }
            }
        }]}
    })
}

pub fn invoice_object(invoice_id: &str, subscription_id: &str, amount_cents: i64) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": "cus_test",
        "subscription": subscription_id,
        "payment_intent": format!("pi_{}", invoice_id),
        "amount_due": amount_cents,
        "amount_paid": amount_cents,
        "currency": "usd",
        "attempt_count": 1,
        "status_transitions": { "paid_at": 1_735_689_600 }
    })
}

pub fn remote_subscription(id: &str, status: SubscriptionStatus) -> RemoteSubscription {
    RemoteSubscription {
        id: id.to_string(),
        customer_id: Some("cus_test".to_string()),
        status,
        cancel_at_period_end: false,
        current_period_start: None,
        current_period_end: None,
        trial_end: None,
        canceled_at: None,
        amount_cents: Some(2500),
        currency: Some("usd".to_string()),
        interval: Some(BillingInterval::Month),
    }
}

#[derive(Default)]
struct Script {
    customer: Option<RemoteCustomer>,
    subscriptions: Vec<RemoteSubscription>,
    invoices: Vec<RemoteInvoice>,
    created_customers: Vec<String>,
    delay: Option<Duration>,
}

/// Processor that answers from canned data
#[derive(Default)]
pub struct ScriptedProcessor {
    script: Mutex<Script>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, id: &str, email: &str) -> Self {
        self.script.get_mut().customer = Some(RemoteCustomer {
            id: id.to_string(),
            email: Some(email.to_string()),
            name: None,
        });
        self
    }

    pub fn with_subscription(mut self, subscription: RemoteSubscription) -> Self {
        self.script.get_mut().subscriptions.push(subscription);
        self
    }

    pub fn with_invoice(mut self, invoice: RemoteInvoice) -> Self {
        self.script.get_mut().invoices.push(invoice);
        self
    }

    /// Delay every lookup, to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.get_mut().delay = Some(delay);
        self
    }

    pub async fn created_customers(&self) -> Vec<String> {
        self.script.lock().await.created_customers.clone()
    }

    pub async fn subscription(&self, id: &str) -> Option<RemoteSubscription> {
        self.script
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    async fn pause(&self) {
        let delay = self.script.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentProcessor for ScriptedProcessor {
    async fn find_customer(
        &self,
        customer_id: Option<&str>,
        email: &str,
    ) -> BillingResult<Option<RemoteCustomer>> {
        self.pause().await;
        let script = self.script.lock().await;
        Ok(script
            .customer
            .as_ref()
            .filter(|c| {
                customer_id == Some(c.id.as_str())
                    || c.email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>> {
        self.pause().await;
        let script = self.script.lock().await;
        Ok(script
            .subscriptions
            .iter()
            .filter(|s| s.customer_id.as_deref().map_or(true, |c| c == customer_id))
            .cloned()
            .collect())
    }

    async fn list_invoices(
        &self,
        _customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<RemoteInvoice>> {
        self.pause().await;
        let script = self.script.lock().await;
        Ok(script.invoices.iter().take(limit as usize).cloned().collect())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<RemoteSubscription> {
        let mut script = self.script.lock().await;
        let subscription = script
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| {
                BillingError::StripeApi(format!("No such subscription: {}", subscription_id))
            })?;
        subscription.cancel_at_period_end = cancel;
        Ok(subscription.clone())
    }

    async fn create_customer(&self, donor: &Donor) -> BillingResult<RemoteCustomer> {
        let mut script = self.script.lock().await;
        let customer = RemoteCustomer {
            id: format!("cus_{}", donor.id.simple()),
            email: Some(donor.email.clone()),
            name: donor.name.clone(),
        };
        script.created_customers.push(customer.id.clone());
        script.customer = Some(customer.clone());
        Ok(customer)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret> {
        Ok(SetupIntentSecret {
            setup_intent_id: "seti_test".to_string(),
            client_secret: "seti_test_secret_abc".to_string(),
            customer_id: customer_id.to_string(),
        })
    }
}

/// Processor whose every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingProcessor;

fn unavailable<T>() -> BillingResult<T> {
    Err(BillingError::StripeApi("processor unavailable".to_string()))
}

#[async_trait]
impl PaymentProcessor for FailingProcessor {
    async fn find_customer(
        &self,
        _customer_id: Option<&str>,
        _email: &str,
    ) -> BillingResult<Option<RemoteCustomer>> {
        unavailable()
    }

    async fn list_subscriptions(
        &self,
        _customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>> {
        unavailable()
    }

    async fn list_invoices(
        &self,
        _customer_id: &str,
        _limit: u64,
    ) -> BillingResult<Vec<RemoteInvoice>> {
        unavailable()
    }

    async fn set_cancel_at_period_end(
        &self,
        _subscription_id: &str,
        _cancel: bool,
    ) -> BillingResult<RemoteSubscription> {
        unavailable()
    }

    async fn create_customer(&self, _donor: &Donor) -> BillingResult<RemoteCustomer> {
        unavailable()
    }

    async fn create_setup_intent(&self, _customer_id: &str) -> BillingResult<SetupIntentSecret> {
        unavailable()
    }
}
