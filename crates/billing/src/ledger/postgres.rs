//! Postgres ledger store

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{DateRange, DonorLookup, EventClaim, Ledger, PROCESSING_TIMEOUT_MINUTES};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Donor, EventOutcome, NewSubscription, NewSubscriptionTransaction, NewTransaction, Package,
    PaymentCorrection, Subscription, SubscriptionState, SubscriptionTransaction, Transaction,
    WebhookEventRecord,
};

const DONOR_COLUMNS: &str = "id, organization_id, email, name, stripe_customer_id, created_at";

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, stripe_subscription_id, stripe_customer_id, donor_id, organization_id, package_id,
    status, current_period_start, current_period_end, cancel_at_period_end,
    trial_start, trial_end, canceled_at, amount_cents, currency, interval,
    created_at, updated_at
"#;

const SUBSCRIPTION_TRANSACTION_COLUMNS: &str = r#"
    id, stripe_invoice_id, stripe_payment_intent_id, subscription_id, donor_id,
    organization_id, amount_cents, currency, status, failure_reason, attempt_count,
    paid_at, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, stripe_payment_intent_id, donor_id, organization_id, package_id, amount_cents,
    currency, status, failure_reason, created_at, updated_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, stripe_event_id, event_type, payload, processing_result, error_message,
    received_at, processing_started_at
"#;

/// Ledger backed by the application database
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn find_donor(&self, lookup: &DonorLookup) -> BillingResult<Option<Donor>> {
        let donor = match lookup {
            DonorLookup::Id(id) => {
                sqlx::query_as::<_, Donor>(&format!(
                    "SELECT {} FROM donors WHERE id = $1",
                    DONOR_COLUMNS
                ))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            DonorLookup::Email(email) => {
                sqlx::query_as::<_, Donor>(&format!(
                    "SELECT {} FROM donors WHERE LOWER(email) = LOWER($1)",
                    DONOR_COLUMNS
                ))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(donor)
    }

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM organizations WHERE id = $1)")
                .bind(organization_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn set_donor_customer_id(
        &self,
        donor_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE donors SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(stripe_customer_id)
        .bind(donor_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("donor {}", donor_id)));
        }

        Ok(())
    }

    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<Package>> {
        let package = sqlx::query_as::<_, Package>(
            r#"
            SELECT id, organization_id, name, amount_cents, currency, interval
            FROM packages
            WHERE id = $1
            "#,
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(package)
    }

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_subscription_by_remote_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn insert_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription> {
        let state = &new.state;

        // A concurrent create for the same remote id turns into an update
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, stripe_customer_id, donor_id, organization_id,
                package_id, status, current_period_start, current_period_end,
                cancel_at_period_end, trial_start, trial_end, canceled_at,
                amount_cents, currency, interval, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW(), NOW()
            )
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                canceled_at = EXCLUDED.canceled_at,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                interval = EXCLUDED.interval,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new.stripe_subscription_id)
        .bind(&new.stripe_customer_id)
        .bind(new.donor_id)
        .bind(new.organization_id)
        .bind(new.package_id)
        .bind(state.status.as_str())
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .bind(state.trial_start)
        .bind(state.trial_end)
        .bind(state.canceled_at)
        .bind(state.amount_cents)
        .bind(&state.currency)
        .bind(state.interval.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn update_subscription_state(
        &self,
        stripe_subscription_id: &str,
        state: &SubscriptionState,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                current_period_start = $3,
                current_period_end = $4,
                cancel_at_period_end = $5,
                trial_start = $6,
                trial_end = $7,
                canceled_at = $8,
                amount_cents = $9,
                currency = $10,
                interval = $11,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .bind(state.status.as_str())
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .bind(state.trial_start)
        .bind(state.trial_end)
        .bind(state.canceled_at)
        .bind(state.amount_cents)
        .bind(&state.currency)
        .bind(state.interval.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn list_donor_subscriptions(&self, donor_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE donor_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(donor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn find_subscription_transaction(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>> {
        let row = sqlx::query_as::<_, SubscriptionTransaction>(&format!(
            "SELECT {} FROM subscription_transactions WHERE stripe_invoice_id = $1",
            SUBSCRIPTION_TRANSACTION_COLUMNS
        ))
        .bind(stripe_invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_subscription_transaction_by_payment_intent(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<SubscriptionTransaction>> {
        let row = sqlx::query_as::<_, SubscriptionTransaction>(&format!(
            "SELECT {} FROM subscription_transactions WHERE stripe_payment_intent_id = $1",
            SUBSCRIPTION_TRANSACTION_COLUMNS
        ))
        .bind(stripe_payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_subscription_transaction(
        &self,
        new: &NewSubscriptionTransaction,
    ) -> BillingResult<SubscriptionTransaction> {
        sqlx::query(
            r#"
            INSERT INTO subscription_transactions (
                id, stripe_invoice_id, stripe_payment_intent_id, subscription_id, donor_id,
                organization_id, amount_cents, currency, status, failure_reason,
                attempt_count, paid_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW()
            )
            ON CONFLICT (stripe_invoice_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.stripe_invoice_id)
        .bind(&new.stripe_payment_intent_id)
        .bind(new.subscription_id)
        .bind(new.donor_id)
        .bind(new.organization_id)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.status.as_str())
        .bind(&new.failure_reason)
        .bind(new.attempt_count)
        .bind(new.paid_at)
        .execute(&self.pool)
        .await?;

        // Either the row we just wrote or the one that won the race
        self.find_subscription_transaction(&new.stripe_invoice_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription transaction {} missing after insert",
                    new.stripe_invoice_id
                ))
            })
    }

    async fn correct_subscription_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<SubscriptionTransaction> {
        let row = sqlx::query_as::<_, SubscriptionTransaction>(&format!(
            r#"
            UPDATE subscription_transactions SET
                status = $2,
                failure_reason = $3,
                attempt_count = COALESCE($4, attempt_count),
                paid_at = COALESCE($5, paid_at),
                stripe_payment_intent_id = COALESCE($6, stripe_payment_intent_id),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(correction.status.as_str())
        .bind(&correction.failure_reason)
        .bind(correction.attempt_count)
        .bind(correction.paid_at)
        .bind(&correction.stripe_payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("subscription transaction {}", id)))
    }

    async fn list_donor_subscription_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<SubscriptionTransaction>> {
        let rows = sqlx::query_as::<_, SubscriptionTransaction>(&format!(
            r#"
            SELECT {}
            FROM subscription_transactions
            WHERE donor_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            "#,
            SUBSCRIPTION_TRANSACTION_COLUMNS
        ))
        .bind(donor_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_transaction(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE stripe_payment_intent_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(stripe_payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_transaction(&self, new: &NewTransaction) -> BillingResult<Transaction> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, stripe_payment_intent_id, donor_id, organization_id, package_id,
                amount_cents, currency, status, failure_reason, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW()
            )
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.stripe_payment_intent_id)
        .bind(new.donor_id)
        .bind(new.organization_id)
        .bind(new.package_id)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.status.as_str())
        .bind(&new.failure_reason)
        .execute(&self.pool)
        .await?;

        self.find_transaction(&new.stripe_payment_intent_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "transaction {} missing after insert",
                    new.stripe_payment_intent_id
                ))
            })
    }

    async fn correct_transaction(
        &self,
        id: Uuid,
        correction: &PaymentCorrection,
    ) -> BillingResult<Transaction> {
        let row = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions SET
                status = $2,
                failure_reason = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(correction.status.as_str())
        .bind(&correction.failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("transaction {}", id)))
    }

    async fn list_donor_transactions(
        &self,
        donor_id: Uuid,
        range: &DateRange,
    ) -> BillingResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE donor_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(donor_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<bool> {
        // INSERT ... ON CONFLICT ... RETURNING hands out the claim to exactly
        // one caller; a stale `processing` row may be taken over.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (id, stripe_event_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $5)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(claim.stripe_event_id)
        .bind(claim.event_type)
        .bind(claim.payload)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn restart_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(outcome.as_str())
        .bind(error_message)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_event(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            "SELECT {} FROM stripe_webhook_events WHERE stripe_event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            r#"
            SELECT {}
            FROM stripe_webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS
        ))
        .bind(outcome.map(|o| o.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
