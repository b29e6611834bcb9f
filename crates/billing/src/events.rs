//! Stripe event payloads
//!
//! Events are parsed into our own serde types rather than the SDK's `Event`,
//! which rejects payloads from API versions newer than the one it was
//! generated against. Only the fields the ledger uses are declared.

use std::collections::HashMap;

use donorledger_shared::{BillingInterval, SubscriptionStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Package, Subscription, SubscriptionState};
use crate::processor::{RemoteInvoice, RemoteSubscription};

/// A verified webhook event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Deserialize `data.object` into one of the payload types below
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayload(format!(
                "{} object for event {}: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

/// Event types the ledger reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoicePaid,
    InvoicePaymentFailed,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    ChargeRefunded,
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => EventKind::TrialWillEnd,
            "invoice.payment_succeeded" | "invoice.paid" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "payment_intent.succeeded" => EventKind::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            "charge.refunded" => EventKind::ChargeRefunded,
            _ => EventKind::Unknown,
        }
    }
}

/// Expandable reference: either a bare id or the expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> &str {
        match self {
            IdOrObject::Id(id) => id,
            IdOrObject::Object { id } => id,
        }
    }
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn ref_id(value: &Option<IdOrObject>) -> Option<&str> {
    value.as_ref().map(IdOrObject::id)
}

pub(crate) fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

/// Read a UUID out of object metadata
fn metadata_uuid(metadata: &HashMap<String, String>, key: &str) -> BillingResult<Uuid> {
    let raw = metadata
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::MissingMetadata(key.to_string()))?;

    Uuid::parse_str(raw.trim())
        .map_err(|_| BillingError::MissingMetadata(format!("{} is not a UUID: {}", key, raw)))
}

/// Amount, currency and interval to use when the remote price is incomplete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pricing {
    pub amount_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

impl From<&Package> for Pricing {
    fn from(package: &Package) -> Self {
        Self {
            amount_cents: package.amount_cents,
            currency: package.currency.clone(),
            interval: package.interval,
        }
    }
}

impl From<&Subscription> for Pricing {
    fn from(subscription: &Subscription) -> Self {
        Self {
            amount_cents: subscription.amount_cents,
            currency: subscription.currency.clone(),
            interval: subscription.interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub items: ItemList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub quantity: Option<i64>,
    // Newer API versions moved the billing period onto the item
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

impl SubscriptionObject {
    pub fn customer_id(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn donor_id(&self) -> BillingResult<Uuid> {
        metadata_uuid(&self.metadata, "donor_id")
    }

    pub fn organization_id(&self) -> BillingResult<Uuid> {
        metadata_uuid(&self.metadata, "organization_id")
    }

    pub fn package_id(&self) -> BillingResult<Uuid> {
        metadata_uuid(&self.metadata, "package_id")
    }

    /// Local status, with remote-only states folded into the fixed enum
    pub fn local_status(&self) -> BillingResult<SubscriptionStatus> {
        SubscriptionStatus::from_remote(&self.status).ok_or_else(|| {
            BillingError::WebhookPayload(format!(
                "subscription {} has unknown status {}",
                self.id, self.status
            ))
        })
    }

    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    fn period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let item = self.first_item();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end));
        (timestamp(start), timestamp(end))
    }

    fn price(&self) -> Option<&PriceObject> {
        self.first_item().and_then(|i| i.price.as_ref())
    }

    fn amount_cents(&self) -> Option<i64> {
        let item = self.first_item()?;
        let unit = item.price.as_ref()?.unit_amount?;
        Some(unit * item.quantity.unwrap_or(1).max(1))
    }

    fn currency(&self) -> Option<String> {
        self.price()
            .and_then(|p| p.currency.as_ref())
            .map(|c| c.to_lowercase())
    }

    fn interval(&self) -> Option<BillingInterval> {
        self.price()
            .and_then(|p| p.recurring.as_ref())
            .and_then(|r| r.interval.parse().ok())
    }

    /// Mutable subscription fields carried by this object.
    ///
    /// Price fields missing from the object are taken from `fallback`.
    pub fn state(&self, fallback: &Pricing) -> BillingResult<SubscriptionState> {
        let (current_period_start, current_period_end) = self.period();
        Ok(SubscriptionState {
            status: self.local_status()?,
            current_period_start,
            current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            trial_start: timestamp(self.trial_start),
            trial_end: timestamp(self.trial_end),
            canceled_at: timestamp(self.canceled_at),
            amount_cents: self.amount_cents().unwrap_or(fallback.amount_cents),
            currency: self.currency().unwrap_or_else(|| fallback.currency.clone()),
            interval: self.interval().unwrap_or(fallback.interval),
        })
    }

    pub fn remote(&self) -> BillingResult<RemoteSubscription> {
        let (current_period_start, current_period_end) = self.period();
        Ok(RemoteSubscription {
            id: self.id.clone(),
            customer_id: self.customer_id().map(str::to_string),
            status: self.local_status()?,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_start,
            current_period_end,
            trial_end: timestamp(self.trial_end),
            canceled_at: timestamp(self.canceled_at),
            amount_cents: self.amount_cents(),
            currency: self.currency(),
            interval: self.interval(),
        })
    }
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub payment_intent: Option<IdOrObject>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount_due: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount_paid: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currency: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attempt_count: i32,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub status_transitions: Option<StatusTransitions>,
    #[serde(default)]
    pub last_finalization_error: Option<ErrorObject>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorObject {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorObject {
    fn reason(&self) -> Option<String> {
        self.message.clone().or_else(|| self.code.clone())
    }
}

impl InvoiceObject {
    /// The subscription this invoice bills, wherever the API version put it
    pub fn subscription_id(&self) -> Option<&str> {
        ref_id(&self.subscription).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| ref_id(&d.subscription))
        })
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }

    pub fn paid_at(&self) -> Option<OffsetDateTime> {
        timestamp(self.status_transitions.as_ref().and_then(|t| t.paid_at))
    }

    pub fn failure_reason(&self) -> String {
        self.last_finalization_error
            .as_ref()
            .and_then(ErrorObject::reason)
            .unwrap_or_else(|| format!("payment attempt {} failed", self.attempt_count.max(1)))
    }

    pub fn remote(&self) -> RemoteInvoice {
        RemoteInvoice {
            id: self.id.clone(),
            subscription_id: self.subscription_id().map(str::to_string),
            status: self.status.clone(),
            amount_due: self.amount_due,
            amount_paid: self.amount_paid,
            currency: self.currency.to_lowercase(),
            created: timestamp(self.created),
            paid_at: self.paid_at(),
            hosted_invoice_url: self.hosted_invoice_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payment intents and charges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount_received: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currency: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub invoice: Option<IdOrObject>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<ErrorObject>,
}

impl PaymentIntentObject {
    pub fn invoice_id(&self) -> Option<&str> {
        ref_id(&self.invoice)
    }

    pub fn donor_id(&self) -> BillingResult<Uuid> {
        metadata_uuid(&self.metadata, "donor_id")
    }

    pub fn organization_id(&self) -> BillingResult<Uuid> {
        metadata_uuid(&self.metadata, "organization_id")
    }

    /// Optional package reference; a malformed value is ignored
    pub fn package_id(&self) -> Option<Uuid> {
        metadata_uuid(&self.metadata, "package_id").ok()
    }

    pub fn failure_reason(&self) -> String {
        self.last_payment_error
            .as_ref()
            .and_then(ErrorObject::reason)
            .unwrap_or_else(|| "payment failed".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<IdOrObject>,
    #[serde(default)]
    pub invoice: Option<IdOrObject>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub refunded: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub amount_refunded: i64,
}

impl ChargeObject {
    pub fn payment_intent_id(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }

    pub fn invoice_id(&self) -> Option<&str> {
        ref_id(&self.invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fallback() -> Pricing {
        Pricing {
            amount_cents: 1000,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
        }
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            EventKind::from_type("invoice.paid"),
            EventKind::InvoicePaid
        );
        assert_eq!(
            EventKind::from_type("invoice.payment_succeeded"),
            EventKind::InvoicePaid
        );
        assert_eq!(
            EventKind::from_type("customer.created"),
            EventKind::Unknown
        );
    }

    #[test]
    fn test_subscription_state_reads_item_price_and_period() {
        let object: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "trialing",
            "cancel_at_period_end": false,
            "trial_end": 1_735_689_600,
            "items": { "data": [{
                "quantity": 2,
                "current_period_start": 1_735_689_600,
                "current_period_end": 1_738_368_000,
                "price": {
                    "unit_amount": 1500,
                    "currency": "EUR",
                    "recurring": { "interval": "year" }
                }
            }]}
        }))
        .unwrap();

        let state = object.state(&fallback()).unwrap();
        assert_eq!(state.status, SubscriptionStatus::Trialing);
        assert_eq!(state.amount_cents, 3000);
        assert_eq!(state.currency, "eur");
        assert_eq!(state.interval, BillingInterval::Year);
        assert_eq!(
            state.current_period_start,
            OffsetDateTime::from_unix_timestamp(1_735_689_600).ok()
        );
        assert!(state.trial_end.is_some());
        assert_eq!(object.customer_id(), Some("cus_1"));
    }

    #[test]
    fn test_subscription_state_uses_fallback_pricing() {
        let object: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": { "id": "cus_9", "object": "customer" },
            "status": "incomplete_expired"
        }))
        .unwrap();

        let state = object.state(&fallback()).unwrap();
        assert_eq!(state.status, SubscriptionStatus::Canceled);
        assert_eq!(state.amount_cents, 1000);
        assert_eq!(state.currency, "usd");
        assert_eq!(object.customer_id(), Some("cus_9"));
    }

    #[test]
    fn test_unknown_subscription_status_is_rejected() {
        let object: SubscriptionObject =
            serde_json::from_value(json!({ "id": "sub_1", "status": "frozen" })).unwrap();
        assert!(matches!(
            object.state(&fallback()),
            Err(BillingError::WebhookPayload(_))
        ));
    }

    #[test]
    fn test_missing_or_malformed_metadata() {
        let object: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "metadata": { "donor_id": "not-a-uuid", "organization_id": "" }
        }))
        .unwrap();

        assert!(matches!(
            object.donor_id(),
            Err(BillingError::MissingMetadata(_))
        ));
        assert!(matches!(
            object.organization_id(),
            Err(BillingError::MissingMetadata(_))
        ));
        assert!(matches!(
            object.package_id(),
            Err(BillingError::MissingMetadata(_))
        ));
    }

    #[test]
    fn test_invoice_subscription_from_parent_details() {
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "id": "in_1",
            "currency": "usd",
            "amount_paid": 2500,
            "parent": {
                "subscription_details": { "subscription": "sub_42" }
            },
            "status_transitions": { "paid_at": 1_735_689_600 }
        }))
        .unwrap();

        assert_eq!(invoice.subscription_id(), Some("sub_42"));
        assert!(invoice.paid_at().is_some());
        assert_eq!(invoice.failure_reason(), "payment attempt 1 failed");
    }

    #[test]
    fn test_event_object_error_names_event() {
        let event = WebhookEvent::parse(
            r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"currency":"usd"}}}"#,
        )
        .unwrap();

        let err = event.object::<InvoiceObject>().unwrap_err();
        assert!(err.to_string().contains("evt_1"));
    }
}
