//! Stripe REST adapter and webhook signature scheme.
//!
//! Requests are form-encoded against `{api_base}/v1/...` with bearer auth.
//! Webhook bodies carry a `Stripe-Signature: t=<unix>,v1=<hex>` header, where
//! `v1` is HMAC-SHA256 of `"{t}.{body}"` keyed with the endpoint secret.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use super::{
    CheckoutSessionRequest, CreatedCheckoutSession, CreatedPaymentIntent, PaymentIntentRequest, PaymentIntentStatus,
    PaymentProcessor, METADATA_VALUE_MAX,
};
use crate::config::PaymentsConfig;
use crate::domain::events::{AttemptMetadata, WebhookEvent};
use crate::{Result, StorefrontError};

type HmacSha256 = Hmac<Sha256>;

pub struct StripeClient {
    client: Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
    tolerance: Duration,
}

#[derive(Deserialize)]
struct ApiErrorBody { error: ApiError }

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

impl StripeClient {
    pub fn new(config: &PaymentsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorefrontError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            tolerance: config.signature_tolerance,
        })
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(&self, path: &str, form: &[(String, String)]) -> Result<T> {
        let url = format!("{}/v1/{path}", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| StorefrontError::PaymentError(format!("Failed to reach payment processor: {e}")))?;
        Self::parse(response).await
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| StorefrontError::PaymentError(format!("Unexpected payment processor response: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.message)
            .unwrap_or(body);
        Err(StorefrontError::PaymentError(format!("Payment processor error ({status}): {message}")))
    }
}

fn push_metadata(form: &mut Vec<(String, String)>, prefix: &str, metadata: &AttemptMetadata) {
    for (key, value) in metadata {
        if value.len() > METADATA_VALUE_MAX {
            tracing::warn!(key = %key, len = value.len(), "Metadata value too long, omitted");
            continue;
        }
        form.push((format!("{prefix}[{key}]"), value.clone()));
    }
}

/// Form fields for a PaymentIntent with automatic payment methods.
pub fn payment_intent_form(request: &PaymentIntentRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), request.amount_minor.to_string()),
        ("currency".to_string(), request.currency.clone()),
        ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
    ];
    if let Some(email) = &request.receipt_email {
        form.push(("receipt_email".to_string(), email.clone()));
    }
    push_metadata(&mut form, "metadata", &request.metadata);
    form
}

/// Form fields for a hosted Checkout Session. Metadata stays on the session
/// only; the session's own PaymentIntent must not look like a second attempt.
pub fn checkout_session_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        ("expires_at".to_string(), request.expires_at.timestamp().to_string()),
        ("phone_number_collection[enabled]".to_string(), "true".to_string()),
    ];
    for (i, item) in request.line_items.iter().enumerate() {
        let p = format!("line_items[{i}]");
        form.push((format!("{p}[quantity]"), item.quantity.to_string()));
        form.push((format!("{p}[price_data][currency]"), request.currency.clone()));
        form.push((format!("{p}[price_data][unit_amount]"), item.unit_amount_minor.to_string()));
        form.push((format!("{p}[price_data][product_data][name]"), item.name.clone()));
    }
    for (i, country) in request.shipping_countries.iter().enumerate() {
        form.push((format!("shipping_address_collection[allowed_countries][{i}]"), country.clone()));
    }
    if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.clone()));
    }
    push_metadata(&mut form, "metadata", &request.metadata);
    form
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> Result<CreatedPaymentIntent> {
        let intent: IntentResponse = self.post_form("payment_intents", &payment_intent_form(&request)).await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| StorefrontError::PaymentError("PaymentIntent without client_secret".into()))?;
        tracing::info!(payment_intent = %intent.id, amount = request.amount_minor, "Created payment intent");
        Ok(CreatedPaymentIntent { id: intent.id, client_secret })
    }

    async fn create_checkout_session(&self, request: CheckoutSessionRequest) -> Result<CreatedCheckoutSession> {
        let session: SessionResponse = self.post_form("checkout/sessions", &checkout_session_form(&request)).await?;
        let url = session
            .url
            .ok_or_else(|| StorefrontError::PaymentError("Checkout session without url".into()))?;
        tracing::info!(session = %session.id, "Created checkout session");
        Ok(CreatedCheckoutSession { id: session.id, url })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntentStatus> {
        let url = format!("{}/v1/payment_intents/{id}", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| StorefrontError::PaymentError(format!("Failed to reach payment processor: {e}")))?;
        let intent: IntentResponse = Self::parse(response).await?;
        Ok(PaymentIntentStatus {
            id: intent.id,
            status: intent.status.unwrap_or_default(),
            amount: intent.amount.unwrap_or_default(),
            currency: intent.currency.unwrap_or_default(),
        })
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> Result<WebhookEvent> {
        if self.webhook_secret.trim().is_empty() {
            return Err(StorefrontError::Config("Missing STRIPE_WEBHOOK_SECRET".into()));
        }
        verify_signature(payload, signature, &self.webhook_secret, self.tolerance, chrono::Utc::now().timestamp())?;
        WebhookEvent::from_json(payload).map_err(|e| StorefrontError::Validation(format!("Malformed event: {e}")))
    }
}

/// Builds a signature header for `payload` as the processor would.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> Result<String> {
    let mut mac = mac_for(secret)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
}

fn mac_for(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| StorefrontError::Config(format!("Invalid webhook secret: {e}")))
}

/// Checks a `t=..,v1=..` header. Any matching `v1` entry is accepted.
/// An empty secret verifies nothing.
pub fn verify_signature(payload: &str, header: &str, secret: &str, tolerance: Duration, now: i64) -> Result<()> {
    if secret.is_empty() {
        return Err(StorefrontError::Config("Missing webhook secret".into()));
    }
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| StorefrontError::InvalidSignature("missing timestamp".into()))?;
    if candidates.is_empty() {
        return Err(StorefrontError::InvalidSignature("no v1 signature".into()));
    }
    let age = now.abs_diff(timestamp);
    if age > tolerance.as_secs() {
        return Err(StorefrontError::InvalidSignature(format!("timestamp outside tolerance ({age}s)")));
    }

    let mut mac = mac_for(secret)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let matched = candidates
        .iter()
        .filter_map(|c| hex::decode(c).ok())
        .any(|expected| mac.clone().verify_slice(&expected).is_ok());
    if matched { Ok(()) } else { Err(StorefrontError::InvalidSignature("signature mismatch".into())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::SessionLineItem;
    use chrono::{TimeZone, Utc};

    const SECRET: &str = "whsec_test";
    const BODY: &str = r#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;

    #[test]
    fn test_signed_payload_verifies() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, Duration::from_secs(300), 1_700_000_100).is_ok());
    }

    #[test]
    fn test_rejects_tampering_and_stale_timestamps() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000).unwrap();
        let tolerance = Duration::from_secs(300);
        assert!(verify_signature(&BODY.replace("pi_1", "pi_2"), &header, SECRET, tolerance, 1_700_000_000).is_err());
        assert!(verify_signature(BODY, &header, "whsec_other", tolerance, 1_700_000_000).is_err());
        assert!(verify_signature(BODY, &header, SECRET, tolerance, 1_700_000_301).is_err());
        assert!(verify_signature(BODY, "v1=abcd", SECRET, tolerance, 1_700_000_000).is_err());
        assert!(verify_signature(BODY, "t=1700000000", SECRET, tolerance, 1_700_000_000).is_err());
    }

    #[test]
    fn test_accepts_any_matching_v1() {
        let good = sign_payload(BODY, SECRET, 1_700_000_000).unwrap();
        let header = format!("t=1700000000,v1=00ff,{}", good.trim_start_matches("t=1700000000,"));
        assert!(verify_signature(BODY, &header, SECRET, Duration::from_secs(300), 1_700_000_000).is_ok());
    }

    fn client(webhook_secret: &str) -> StripeClient {
        StripeClient::new(&PaymentsConfig {
            secret_key: "sk_test".into(),
            webhook_secret: webhook_secret.into(),
            api_base: "https://api.stripe.test".into(),
            signature_tolerance: Duration::from_secs(300),
        })
        .unwrap()
    }

    #[test]
    fn test_unset_webhook_secret_rejects_every_event() {
        let now = Utc::now().timestamp();
        let forged = sign_payload(BODY, "", now).unwrap();
        for secret in ["", "  "] {
            let err = client(secret).verify_webhook(BODY, &forged).unwrap_err();
            assert!(matches!(err, StorefrontError::Config(ref m) if m.contains("STRIPE_WEBHOOK_SECRET")), "{err}");
        }
        assert!(matches!(
            verify_signature(BODY, &forged, "", Duration::from_secs(300), now),
            Err(StorefrontError::Config(_))
        ));

        let signed = sign_payload(BODY, SECRET, now).unwrap();
        assert_eq!(client(SECRET).verify_webhook(BODY, &signed).unwrap().id, "evt_1");
    }

    #[test]
    fn test_session_form_encodes_nested_fields() {
        let mut metadata = AttemptMetadata::new();
        metadata.insert("quantities".into(), r#"{"mug-blue":1}"#.into());
        metadata.insert("cart_items_compact".into(), "x".repeat(600));
        metadata.insert(crate::inventory::metadata::CHECKOUT_MARKER.into(), "1".into());
        let request = CheckoutSessionRequest {
            line_items: vec![SessionLineItem { name: "Blue mug".into(), unit_amount_minor: 8950, quantity: 1 }],
            currency: "pln".into(),
            metadata,
            success_url: "https://shop.test/success".into(),
            cancel_url: "https://shop.test/cart".into(),
            expires_at: Utc.timestamp_opt(1_700_001_800, 0).unwrap(),
            shipping_countries: vec!["PL".into(), "DE".into()],
            customer_email: None,
        };
        let form = checkout_session_form(&request);
        let has = |k: &str, v: &str| form.iter().any(|(fk, fv)| fk == k && fv == v);
        assert!(has("line_items[0][price_data][unit_amount]", "8950"));
        assert!(has("shipping_address_collection[allowed_countries][1]", "DE"));
        assert!(has("expires_at", "1700001800"));
        assert!(has("metadata[quantities]", r#"{"mug-blue":1}"#));
        assert!(!form.iter().any(|(k, _)| k.starts_with("payment_intent_data")));
        assert!(!form.iter().any(|(k, _)| k.contains("cart_items_compact")));
        assert!(has("metadata[storefront_checkout]", "1"));
    }
}
