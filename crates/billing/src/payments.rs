//! Payment method setup

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{DonorLookup, Ledger};
use crate::processor::{PaymentProcessor, SetupIntentSecret};

pub struct PaymentSetupService {
    ledger: Arc<dyn Ledger>,
    processor: Arc<dyn PaymentProcessor>,
}

impl PaymentSetupService {
    pub fn new(ledger: Arc<dyn Ledger>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { ledger, processor }
    }

    /// Make sure the donor has a processor customer, then open a SetupIntent
    /// for collecting a payment method
    pub async fn setup_payment(&self, donor_id: Uuid) -> BillingResult<SetupIntentSecret> {
        let donor = self
            .ledger
            .find_donor(&DonorLookup::Id(donor_id))
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Donor {}", donor_id)))?;

        let customer_id = match donor.stripe_customer_id.clone() {
            Some(id) => id,
            None => {
                let customer = self.processor.create_customer(&donor).await?;
                self.ledger
                    .set_donor_customer_id(donor.id, &customer.id)
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            donor_id = %donor.id,
                            customer_id = %customer.id,
                            error = %e,
                            "Failed to store Stripe customer id"
                        );
                        e
                    })?;
                customer.id
            }
        };

        let secret = self.processor.create_setup_intent(&customer_id).await?;

        tracing::info!(
            donor_id = %donor.id,
            customer_id = %customer_id,
            setup_intent_id = %secret.setup_intent_id,
            "Created SetupIntent"
        );
        Ok(secret)
    }
}
