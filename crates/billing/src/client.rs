//! Stripe client configuration

use crate::error::{BillingError, BillingResult};

/// Default tolerance for webhook timestamps, in seconds
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe configuration loaded from the environment
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook before it is rejected
    pub webhook_tolerance_secs: i64,
    /// Override for the Stripe API base URL (used against local mocks)
    pub api_base: Option<String>,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`,
    /// `STRIPE_WEBHOOK_TOLERANCE_SECS` and `STRIPE_API_BASE`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        if secret_key.trim().is_empty() || webhook_secret.trim().is_empty() {
            return Err(BillingError::Config(
                "Stripe keys must not be empty".to_string(),
            ));
        }

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("Invalid STRIPE_WEBHOOK_TOLERANCE_SECS: {}", raw))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        let api_base = std::env::var("STRIPE_API_BASE")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
            api_base,
        })
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = match &config.api_base {
            Some(base) => stripe::Client::from_url(base.as_str(), config.secret_key.clone()),
            None => stripe::Client::new(config.secret_key.clone()),
        };
        Self { inner }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }
}
