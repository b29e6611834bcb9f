// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DonorLedger shared types and database helpers

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{BillingInterval, ParseEnumError, SubscriptionStatus, TransactionStatus};
