//! Application state

use std::sync::Arc;

use donorledger_billing::{BillingService, Ledger, MembershipAggregator};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<dyn Ledger>,
    /// Stripe-backed services; None when billing is disabled or not configured
    pub billing: Option<Arc<BillingService>>,
    pub membership: Arc<MembershipAggregator>,
}

impl AppState {
    pub fn new(config: Config, ledger: Arc<dyn Ledger>) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(ledger.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(config, ledger, billing)
    }

    /// Build state around an already constructed billing service
    pub fn with_billing(
        config: Config,
        ledger: Arc<dyn Ledger>,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        let processor = billing.as_ref().map(|b| b.processor.clone());
        if processor.is_none() {
            tracing::warn!("Membership reports will use ledger data only");
        }

        let membership = Arc::new(MembershipAggregator::new(
            ledger.clone(),
            processor,
            config.remote_fetch_timeout,
        ));

        Self {
            config,
            ledger,
            billing,
            membership,
        }
    }

    /// Billing service, or 503 when it is unavailable
    pub fn billing_service(&self) -> Result<&Arc<BillingService>, crate::error::ApiError> {
        self.billing.as_ref().ok_or_else(|| {
            crate::error::ApiError::ServiceUnavailable("Billing is not configured".to_string())
        })
    }
}
