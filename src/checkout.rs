//! Checkout orchestration.
//!
//! Both flows run the same steps: reclaim expired holds, seed stock from the
//! CMS, reserve, gate on backorder, create the payment attempt, persist the
//! reservation record and schedule its reclaim. Any failure after stock was
//! reserved releases it again before the error is returned. Carts whose
//! settlement metadata would not fit the processor's limits are refused
//! before anything is reserved.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cms::{Cms, CmsProduct};
use crate::config::CheckoutConfig;
use crate::domain::checkout::{total_minor_units, CheckoutLine, CheckoutRequest};
use crate::domain::events::{AttemptId, AttemptMetadata};
use crate::domain::value_objects::Slug;
use crate::inventory::metadata::{self, ReservedStock};
use crate::inventory::{AttemptOutcome, Claim, Inventory, ReservationOutcome, ReservationRecord, StockLevels};
use crate::payments::{
    CheckoutSessionRequest, PaymentIntentRequest, PaymentIntentStatus, PaymentProcessor, SessionLineItem,
    METADATA_VALUE_MAX,
};
use crate::store::RetryPolicy;
use crate::{Result, StorefrontError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionStarted {
    pub url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentStarted {
    pub client_secret: String,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductAvailability {
    pub product: CmsProduct,
    pub stock: i64,
    pub reserve: i64,
    pub available: i64,
}

impl ProductAvailability {
    fn new(product: CmsProduct, levels: StockLevels) -> Self {
        Self { product, stock: levels.stock, reserve: levels.reserve, available: levels.available() }
    }
}

pub struct CheckoutService {
    inventory: Inventory,
    payments: Arc<dyn PaymentProcessor>,
    cms: Arc<dyn Cms>,
    config: CheckoutConfig,
    retry: RetryPolicy,
}

impl CheckoutService {
    pub fn new(inventory: Inventory, payments: Arc<dyn PaymentProcessor>, cms: Arc<dyn Cms>, config: CheckoutConfig) -> Self {
        Self { inventory, payments, cms, config, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }

    /// Hosted checkout: reserves stock and opens a checkout session that
    /// expires together with the reservation.
    pub async fn start_checkout_session(&self, request: &CheckoutRequest, origin: &str) -> Result<CheckoutSessionStarted> {
        let lines = request.lines(&self.config.currency)?;
        let line_items = lines
            .iter()
            .map(|line| {
                let unit_amount_minor = line.unit_price.minor_units().map_err(|e| StorefrontError::Validation(e.to_string()))?;
                Ok(SessionLineItem { name: line.name.clone(), unit_amount_minor, quantity: line.quantity })
            })
            .collect::<Result<Vec<_>>>()?;
        total_minor_units(&lines)?;

        let outcome = self.reserve(request, &lines).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs(&self.config));
        let first_slug = lines.first().map(|l| l.slug.to_string()).unwrap_or_default();
        let session_request = CheckoutSessionRequest {
            line_items,
            currency: self.config.currency.clone(),
            metadata: attempt_metadata(request, &lines, &outcome),
            success_url: format!("{origin}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{origin}/checkout/cancel?product={first_slug}"),
            expires_at,
            shipping_countries: self.config.shipping_countries.clone(),
            customer_email: request.customer.as_ref().and_then(|c| c.email.clone()),
        };

        let session = match self.payments.create_checkout_session(session_request).await {
            Ok(session) => session,
            Err(e) => return Err(self.compensate(&outcome.reserved, e).await),
        };
        let attempt = AttemptId::CheckoutSession(session.id.clone());
        self.persist(&attempt, &outcome.reserved).await?;

        tracing::info!(attempt = %attempt, items = lines.len(), backorder = outcome.has_backorder(), "Checkout session started");
        Ok(CheckoutSessionStarted { url: session.url, session_id: session.id })
    }

    /// Embedded card payment: reserves stock and creates a payment intent
    /// carrying the customer and delivery details.
    pub async fn create_payment_intent(&self, request: &CheckoutRequest) -> Result<PaymentIntentStarted> {
        let lines = request.lines(&self.config.currency)?;
        let customer = request
            .customer
            .as_ref()
            .filter(|c| c.has_contact_details())
            .ok_or_else(|| StorefrontError::Validation("Missing customer details".into()))?;
        let amount_minor = total_minor_units(&lines)?;

        let outcome = self.reserve(request, &lines).await?;
        let intent_request = PaymentIntentRequest {
            amount_minor,
            currency: self.config.currency.clone(),
            metadata: attempt_metadata(request, &lines, &outcome),
            receipt_email: customer.email.clone(),
        };

        let intent = match self.payments.create_payment_intent(intent_request).await {
            Ok(intent) => intent,
            Err(e) => return Err(self.compensate(&outcome.reserved, e).await),
        };
        let attempt = AttemptId::PaymentIntent(intent.id.clone());
        self.persist(&attempt, &outcome.reserved).await?;

        tracing::info!(attempt = %attempt, amount = amount_minor, backorder = outcome.has_backorder(), "Payment intent created");
        Ok(PaymentIntentStarted { client_secret: intent.client_secret, payment_intent_id: intent.id })
    }

    pub async fn payment_status(&self, payment_intent_id: &str) -> Result<PaymentIntentStatus> {
        let id = payment_intent_id.trim();
        if id.is_empty() {
            return Err(StorefrontError::Validation("Missing paymentIntentId".into()));
        }
        self.payments.retrieve_payment_intent(id).await
    }

    /// CMS product with its ledger levels, seeding the ledger on first view.
    pub async fn product_availability(&self, slug: &Slug) -> Result<ProductAvailability> {
        let product = self
            .cms
            .get_product(slug)
            .await?
            .ok_or_else(|| StorefrontError::ProductNotFound(slug.to_string()))?;
        if let Some(stock) = product.stock {
            self.inventory.ledger.seed(slug, stock).await?;
        }
        let levels = self.inventory.ledger.levels(slug).await?;
        Ok(ProductAvailability::new(product, levels))
    }

    async fn reserve(&self, request: &CheckoutRequest, lines: &[CheckoutLine]) -> Result<ReservationOutcome> {
        check_metadata_fits(lines)?;
        if let Err(e) = self.inventory.scheduler.reclaim_expired(Utc::now()).await {
            tracing::warn!(error = %e, "Opportunistic reclaim failed");
        }
        self.seed_from_cms(lines).await?;

        let items: Vec<(Slug, u32)> = lines.iter().map(|l| (l.slug.clone(), l.quantity)).collect();
        let outcome = self.inventory.engine.reserve(&items).await?;

        if outcome.has_backorder() && !request.allow_backorder {
            tracing::info!(backorder = ?outcome.backorder, "Backorder needs confirmation, releasing reservation");
            self.release(&outcome.reserved).await;
            return Err(StorefrontError::BackorderConfirmationRequired { backorder: outcome.backorder });
        }
        Ok(outcome)
    }

    /// Set-if-absent only: an existing ledger value is never overwritten here.
    async fn seed_from_cms(&self, lines: &[CheckoutLine]) -> Result<()> {
        for line in lines {
            match self.cms.get_product(&line.slug).await {
                Ok(Some(CmsProduct { stock: Some(stock), .. })) => {
                    self.inventory.ledger.seed(&line.slug, stock).await?;
                }
                Ok(_) => tracing::debug!(slug = %line.slug, "No CMS stock to seed"),
                Err(e) => tracing::warn!(slug = %line.slug, error = %e, "CMS lookup failed, reserving against ledger as is"),
            }
        }
        Ok(())
    }

    async fn compensate(&self, reserved: &ReservedStock, error: StorefrontError) -> StorefrontError {
        tracing::error!(error = %error, "Payment attempt creation failed, releasing reservation");
        self.release(reserved).await;
        error
    }

    /// Releases units no record tracks. Anything left held can only be
    /// reported.
    async fn release(&self, reserved: &ReservedStock) {
        let unreleased = self.inventory.engine.release(reserved).await;
        if !unreleased.is_empty() {
            tracing::error!(unreleased = ?unreleased, "Units left held, needs reconciliation");
        }
    }

    /// Settles an attempt whose reservation could not be tracked. Claiming
    /// the release first turns any later event for it into a no-op.
    async fn abandon(&self, attempt: &AttemptId, reserved: &ReservedStock) {
        match self.inventory.outcomes.claim(attempt, AttemptOutcome::Released).await {
            Ok(Claim::Won) => {}
            Ok(Claim::Lost(previous)) => {
                tracing::warn!(attempt = %attempt, previous = ?previous, "Attempt settled before its reservation was tracked");
                return;
            }
            Err(e) => tracing::error!(attempt = %attempt, error = %e, "Failed to claim release outcome"),
        }
        if let Err(e) = self.inventory.records.take(attempt).await {
            tracing::warn!(attempt = %attempt, error = %e, "Failed to drop reservation record");
        }
        self.release(reserved).await;
    }

    async fn persist(&self, attempt: &AttemptId, reserved: &ReservedStock) -> Result<()> {
        if reserved.is_empty() {
            tracing::debug!(attempt = %attempt, "Nothing reserved in stock, no record kept");
            return Ok(());
        }
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs(&self.config));
        let record = ReservationRecord::new(attempt, reserved, now, expires_at);

        if let Err(e) = self.inventory.records.save(attempt, &record, self.config.record_ttl()).await {
            tracing::error!(attempt = %attempt, error = %e, "Failed to save reservation record, releasing");
            self.abandon(attempt, reserved).await;
            return Err(e);
        }

        // Payment intents get no expiry event, so every hold needs an entry.
        let scheduled = self
            .retry
            .run("schedule_reclaim", || self.inventory.scheduler.schedule(attempt, expires_at))
            .await;
        if let Err(e) = scheduled {
            tracing::error!(attempt = %attempt, error = %e, "Failed to schedule reclaim, releasing");
            self.abandon(attempt, reserved).await;
            return Err(e);
        }
        Ok(())
    }
}

/// `quantities` is the longest metadata value settlement depends on: the
/// reserved and backorder maps hold the same slugs with smaller counts.
fn check_metadata_fits(lines: &[CheckoutLine]) -> Result<()> {
    let quantities: BTreeMap<Slug, u32> = lines.iter().map(|l| (l.slug.clone(), l.quantity)).collect();
    let encoded = metadata::encode_map(&quantities).len();
    if encoded > METADATA_VALUE_MAX {
        return Err(StorefrontError::Validation(format!(
            "Cart too large to check out in one order ({encoded} of {METADATA_VALUE_MAX} characters), please split it"
        )));
    }
    Ok(())
}

fn ttl_secs(config: &CheckoutConfig) -> i64 {
    i64::try_from(config.reservation_ttl.as_secs()).unwrap_or(i64::MAX / 1000)
}

/// Everything settlement needs if the store-side record is lost.
pub fn attempt_metadata(request: &CheckoutRequest, lines: &[CheckoutLine], outcome: &ReservationOutcome) -> AttemptMetadata {
    let quantities: BTreeMap<Slug, u32> = lines.iter().map(|l| (l.slug.clone(), l.quantity)).collect();
    let slugs: Vec<&str> = lines.iter().map(|l| l.slug.as_str()).collect();
    let compact: Vec<_> = lines
        .iter()
        .map(|l| json!({ "slug": l.slug, "name": l.name, "quantity": l.quantity }))
        .collect();

    let mut m = AttemptMetadata::new();
    m.insert(metadata::CHECKOUT_MARKER.into(), "1".into());
    m.insert(metadata::QUANTITIES.into(), metadata::encode_map(&quantities));
    m.insert(metadata::RESERVED_IN_STOCK.into(), metadata::encode_map(&outcome.reserved));
    m.insert(metadata::BACKORDER.into(), metadata::encode_map(&outcome.backorder));
    m.insert(metadata::PRODUCT_SLUGS.into(), json!(slugs).to_string());
    m.insert(metadata::CART_ITEMS.into(), json!(compact).to_string());
    m.insert(metadata::DELIVERY_METHOD.into(), request.delivery_method.as_str().into());
    if let Some(point) = request.delivery_point.as_ref().filter(|p| !p.is_null()) {
        m.insert(metadata::DELIVERY_POINT.into(), point.to_string());
    }

    if let Some(c) = &request.customer {
        let fields = [
            ("customer_email", &c.email),
            ("customer_phone", &c.phone),
            ("customer_name", &c.name),
            ("shipping_street", &c.street),
            ("shipping_postal_code", &c.postal_code),
            ("shipping_city", &c.city),
        ];
        for (key, value) in fields {
            m.insert(key.into(), value.clone().unwrap_or_default());
        }
        m.insert("shipping_country".into(), c.country.clone().unwrap_or_else(|| "PL".into()));
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderRecord;
    use crate::domain::events::PaymentIntentObject;

    #[test]
    fn test_metadata_round_trips_into_order_and_fallback() {
        let request: CheckoutRequest = serde_json::from_value(json!({
            "items": [
                {"slug": "mug-blue", "name": "Blue mug", "unitPrice": 89.5, "quantity": 2},
                {"slug": "vase", "name": "Vase", "unitPrice": 240}
            ],
            "deliveryMethod": "inpost",
            "inpostPoint": {"name": "KRA01M"},
            "customer": {"email": "ola@example.com", "phone": "600", "name": "Ola", "street": "Długa 1", "postalCode": "31-000", "city": "Kraków"}
        }))
        .unwrap();
        let lines = request.lines("pln").unwrap();
        let mug = Slug::new("mug-blue").unwrap();
        let vase = Slug::new("vase").unwrap();
        let outcome = ReservationOutcome {
            reserved: ReservedStock::from([(mug.clone(), 1), (vase.clone(), 1)]),
            backorder: BTreeMap::from([(mug.clone(), 1)]),
        };

        let m = attempt_metadata(&request, &lines, &outcome);
        assert_eq!(metadata::reserved_from_attempt(&m), outcome.reserved);
        assert_eq!(m["shipping_country"], "PL");
        assert_eq!(m[metadata::CHECKOUT_MARKER], "1");

        let intent = PaymentIntentObject { id: "pi_1".into(), metadata: m, ..Default::default() };
        let order = OrderRecord::from_payment_intent(&intent);
        assert_eq!(order.product_slugs, vec!["mug-blue", "vase"]);
        assert_eq!(order.quantities.get("mug-blue"), Some(&2));
        assert_eq!(order.backorder.get("mug-blue"), Some(&1));
        assert_eq!(order.customer.city, "Kraków");
        assert_eq!(order.delivery.point, Some(json!({"name": "KRA01M"})));
    }

    #[test]
    fn test_oversized_cart_is_refused() {
        let line = |i: usize| CheckoutLine {
            slug: Slug::new(format!("hand-thrown-stoneware-bowl-speckled-{i:02}")).unwrap(),
            name: "Bowl".into(),
            unit_price: crate::domain::value_objects::Money::new(rust_decimal::Decimal::from(120), "pln"),
            quantity: 1,
        };
        let small: Vec<_> = (0..3).map(line).collect();
        assert!(check_metadata_fits(&small).is_ok());
        let large: Vec<_> = (0..12).map(line).collect();
        assert!(matches!(check_metadata_fits(&large), Err(StorefrontError::Validation(_))));
    }
}
