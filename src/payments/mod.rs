//! Payment processor boundary

pub mod stripe;

pub use self::stripe::StripeClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::events::{AttemptMetadata, WebhookEvent};
use crate::Result;

/// Longest metadata value the processor keeps. Longer values are dropped.
pub const METADATA_VALUE_MAX: usize = 500;

#[derive(Clone, Debug)]
pub struct PaymentIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: AttemptMetadata,
    pub receipt_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedPaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug)]
pub struct SessionLineItem {
    pub name: String,
    pub unit_amount_minor: i64,
    pub quantity: u32,
}

#[derive(Clone, Debug)]
pub struct CheckoutSessionRequest {
    pub line_items: Vec<SessionLineItem>,
    pub currency: String,
    pub metadata: AttemptMetadata,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
    pub shipping_countries: Vec<String>,
    pub customer_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymentIntentStatus {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

/// Hosted payment processor.
///
/// Implementations must not retry attempt creation on their own; the
/// checkout flow compensates reservations when creation fails.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> Result<CreatedPaymentIntent>;

    async fn create_checkout_session(&self, request: CheckoutSessionRequest) -> Result<CreatedCheckoutSession>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntentStatus>;

    /// Authenticates a raw webhook body against its signature header and parses it.
    ///
    /// # Errors
    ///
    /// `InvalidSignature` when the header is malformed, stale or does not match.
    fn verify_webhook(&self, payload: &str, signature: &str) -> Result<WebhookEvent>;
}
