// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries processor messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! DonorLedger API Library
//!
//! HTTP surface for the donation ledger: the Stripe webhook endpoint,
//! membership reports, subscription actions, payment setup and webhook
//! administration.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
