//! Payment processor events consumed by settlement

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;

/// String metadata attached to a payment attempt.
pub type AttemptMetadata = BTreeMap<String, String>;

/// Identifier of one checkout attempt as issued by the payment processor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttemptId {
    CheckoutSession(String),
    PaymentIntent(String),
}

impl AttemptId {
    pub fn kind(&self) -> &'static str {
        match self { Self::CheckoutSession(_) => "session", Self::PaymentIntent(_) => "payment_intent" }
    }
    pub fn id(&self) -> &str {
        match self { Self::CheckoutSession(id) | Self::PaymentIntent(id) => id }
    }
    /// Inverse of `Display`: `session:cs_123` or `payment_intent:pi_123`.
    pub fn parse(value: &str) -> Option<Self> {
        let (kind, id) = value.split_once(':')?;
        if id.is_empty() { return None; }
        match kind {
            "session" => Some(Self::CheckoutSession(id.to_string())),
            "payment_intent" => Some(Self::PaymentIntent(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.kind(), self.id()) }
}

#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: String,
    pub payload: PaymentEvent,
}

#[derive(Clone, Debug)]
pub enum PaymentEvent {
    CheckoutSessionCompleted(CheckoutSessionObject),
    CheckoutSessionExpired(CheckoutSessionObject),
    PaymentIntentSucceeded(PaymentIntentObject),
    PaymentIntentFailed(PaymentIntentObject),
    Ignored,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: AttemptMetadata,
    #[serde(default)]
    pub customer_details: Option<SessionCustomerDetails>,
}

impl CheckoutSessionObject {
    pub fn is_paid(&self) -> bool { self.payment_status.as_deref() == Some("paid") }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionCustomerDetails {
    #[serde(default)] pub name: Option<String>,
    #[serde(default)] pub email: Option<String>,
    #[serde(default)] pub phone: Option<String>,
    #[serde(default)] pub address: Option<SessionAddress>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionAddress {
    #[serde(default)] pub line1: Option<String>,
    #[serde(default)] pub postal_code: Option<String>,
    #[serde(default)] pub city: Option<String>,
    #[serde(default)] pub country: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: AttemptMetadata,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData { object: serde_json::Value }

impl WebhookEvent {
    /// Parses a verified event body. Unknown event kinds become `PaymentEvent::Ignored`.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let object = envelope.data.object;
        let payload = match envelope.kind.as_str() {
            "checkout.session.completed" => PaymentEvent::CheckoutSessionCompleted(serde_json::from_value(object)?),
            "checkout.session.expired" => PaymentEvent::CheckoutSessionExpired(serde_json::from_value(object)?),
            "payment_intent.succeeded" => PaymentEvent::PaymentIntentSucceeded(serde_json::from_value(object)?),
            "payment_intent.payment_failed" => PaymentEvent::PaymentIntentFailed(serde_json::from_value(object)?),
            _ => PaymentEvent::Ignored,
        };
        Ok(Self { id: envelope.id, kind: envelope.kind, payload })
    }
}

fn lenient_metadata<'de, D>(deserializer: D) -> Result<AttemptMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(serde_json::Value::Object(map)) = value else { return Ok(AttemptMetadata::new()) };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Null => None,
            other => Some((k, other.to_string())),
        })
        .collect())
}
