//! Ceramics Storefront
//!
//! Backend for a handmade-ceramics shop. Product content lives in a headless
//! CMS, payments are taken by a hosted payment processor and inventory
//! counters live in a shared key-value store.
//!
//! ## Features
//! - Stock ledger with `stock` / `reserve` counters per product
//! - Optimistic stock reservation with backorder split
//! - Reclaim of abandoned reservations (opportunistic and periodic)
//! - Idempotent settlement of payment webhooks
//! - Admin stock sync from the CMS

use std::collections::BTreeMap;
use thiserror::Error;

pub mod api;
pub mod checkout;
pub mod cms;
pub mod config;
pub mod domain;
pub mod inventory;
pub mod payments;
pub mod settlement;
pub mod store;
pub mod sync;

pub use config::Config;
pub use domain::value_objects::{Money, Slug};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum StorefrontError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Some items are no longer in stock")]
    BackorderConfirmationRequired { backorder: BTreeMap<Slug, u32> },

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Payment processor error: {0}")]
    PaymentError(String),

    #[error("CMS error: {0}")]
    CmsError(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for StorefrontError {
    fn from(err: redis::RedisError) -> Self {
        Self::StorageError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for StorefrontError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorefrontError>;
