//! Settlement of payment webhooks.
//!
//! Each event is processed at most once (event marker, set-if-absent). Each
//! attempt reaches exactly one terminal outcome (outcome marker, then an
//! atomic take of its reservation record). Taking the record is the commit
//! point: failures before it roll the markers back and answer 500 so the
//! processor retries. After it, deduction errors are retried, then logged for
//! reconciliation; units a release could not return are requeued and the
//! event answers 500.

use axum::http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::cms::Cms;
use crate::domain::events::{AttemptId, AttemptMetadata, PaymentEvent, WebhookEvent};
use crate::domain::order::OrderRecord;
use crate::inventory::metadata::{
    reserved_from_attempt, ReservedStock, CHECKOUT_MARKER, LEGACY_RESERVED_IN_STOCK, QUANTITIES, RESERVED_IN_STOCK,
};
use crate::inventory::{AttemptOutcome, Claim, Inventory};
use crate::payments::PaymentProcessor;
use crate::store::{keys, AtomicStore, RetryPolicy, SetOptions};
use crate::{Result, StorefrontError};

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl WebhookResponse {
    fn ok(body: Value) -> Self { Self { status: StatusCode::OK, body } }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, body: json!({ "error": message.into() }) }
    }
}

enum Settlement {
    /// This path owns the attempt; the held units are returned.
    Claimed(ReservedStock),
    AlreadySettled(Option<AttemptOutcome>),
}

pub struct SettlementHandler {
    store: Arc<dyn AtomicStore>,
    inventory: Inventory,
    payments: Arc<dyn PaymentProcessor>,
    cms: Arc<dyn Cms>,
    retry: RetryPolicy,
    processed_ttl: Duration,
}

impl SettlementHandler {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        inventory: Inventory,
        payments: Arc<dyn PaymentProcessor>,
        cms: Arc<dyn Cms>,
        processed_ttl: Duration,
    ) -> Self {
        Self { store, inventory, payments, cms, retry: RetryPolicy::default(), processed_ttl }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }

    /// Verifies, deduplicates and applies one webhook delivery.
    pub async fn handle_event(&self, raw: &str, signature: Option<&str>) -> WebhookResponse {
        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            tracing::warn!("Webhook without signature header");
            return WebhookResponse::error(StatusCode::BAD_REQUEST, "Missing stripe-signature header");
        };
        let event = match self.payments.verify_webhook(raw, signature) {
            Ok(event) => event,
            Err(e @ (StorefrontError::InvalidSignature(_) | StorefrontError::Validation(_))) => {
                tracing::warn!(error = %e, "Rejected webhook");
                return WebhookResponse::error(StatusCode::BAD_REQUEST, format!("Webhook Error: {e}"));
            }
            Err(e) => {
                tracing::error!(error = %e, "Webhook verification unavailable");
                return WebhookResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };

        match self.process(&event).await {
            Ok(body) => WebhookResponse::ok(body),
            Err(e) => {
                tracing::error!(event_id = %event.id, kind = %event.kind, error = %e, "Webhook processing failed, processor will retry");
                WebhookResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn process(&self, event: &WebhookEvent) -> Result<Value> {
        let marker = keys::processed_event(&event.id);
        let first = self.store.set(&marker, "1", SetOptions::nx().with_ttl(self.processed_ttl)).await?;
        if !first {
            tracing::info!(event_id = %event.id, kind = %event.kind, "Duplicate webhook delivery");
            return Ok(json!({ "received": true, "duplicate": true }));
        }

        let result = self.dispatch(event).await;
        if result.is_err() {
            if let Err(e) = self.store.del(&marker).await {
                tracing::error!(event_id = %event.id, error = %e, "Failed to roll back event marker");
            }
        }
        result
    }

    async fn dispatch(&self, event: &WebhookEvent) -> Result<Value> {
        match &event.payload {
            PaymentEvent::CheckoutSessionCompleted(session) => {
                if !session.is_paid() {
                    tracing::info!(event_id = %event.id, session = %session.id, status = ?session.payment_status, "Checkout session completed without payment");
                    return Ok(json!({ "received": true, "ignored": "unpaid" }));
                }
                let attempt = AttemptId::CheckoutSession(session.id.clone());
                self.commit(&attempt, &session.metadata, OrderRecord::from_checkout_session(session)).await
            }
            PaymentEvent::PaymentIntentSucceeded(intent) => {
                if !is_storefront_attempt(&intent.metadata) {
                    return Ok(foreign_intent(&event.id, &intent.id));
                }
                let attempt = AttemptId::PaymentIntent(intent.id.clone());
                self.commit(&attempt, &intent.metadata, OrderRecord::from_payment_intent(intent)).await
            }
            PaymentEvent::CheckoutSessionExpired(session) => {
                self.release(&AttemptId::CheckoutSession(session.id.clone()), &session.metadata).await
            }
            PaymentEvent::PaymentIntentFailed(intent) => {
                if !is_storefront_attempt(&intent.metadata) {
                    return Ok(foreign_intent(&event.id, &intent.id));
                }
                self.release(&AttemptId::PaymentIntent(intent.id.clone()), &intent.metadata).await
            }
            PaymentEvent::Ignored => {
                tracing::debug!(event_id = %event.id, kind = %event.kind, "Ignoring webhook event");
                Ok(json!({ "received": true, "ignored": event.kind }))
            }
        }
    }

    /// Claims `outcome` for the attempt and takes its reservation record.
    async fn claim_reservation(
        &self,
        attempt: &AttemptId,
        outcome: AttemptOutcome,
        metadata: &AttemptMetadata,
    ) -> Result<Settlement> {
        if let Claim::Lost(previous) = self.inventory.outcomes.claim(attempt, outcome).await? {
            return Ok(Settlement::AlreadySettled(previous));
        }
        match self.inventory.records.take(attempt).await {
            Ok(Some(reserved)) => Ok(Settlement::Claimed(reserved)),
            Ok(None) => {
                let fallback = reserved_from_attempt(metadata);
                tracing::warn!(attempt = %attempt, items = fallback.len(), "Reservation record missing, using attempt metadata");
                Ok(Settlement::Claimed(fallback))
            }
            Err(e) => {
                if let Err(rollback) = self.inventory.outcomes.withdraw(attempt).await {
                    tracing::error!(attempt = %attempt, error = %rollback, "Failed to withdraw outcome claim");
                }
                Err(e)
            }
        }
    }

    async fn commit(&self, attempt: &AttemptId, metadata: &AttemptMetadata, order: OrderRecord) -> Result<Value> {
        let reserved = match self.claim_reservation(attempt, AttemptOutcome::Committed, metadata).await? {
            Settlement::Claimed(reserved) => reserved,
            Settlement::AlreadySettled(Some(AttemptOutcome::Committed)) => {
                tracing::info!(attempt = %attempt, "Attempt already committed");
                return Ok(json!({ "received": true, "outcome": "committed" }));
            }
            Settlement::AlreadySettled(previous) => {
                // Payment is authoritative: record the order, the units become made-to-order.
                tracing::warn!(attempt = %attempt, previous = ?previous, "Payment succeeded after reservation was released");
                self.cancel_schedule(attempt).await;
                self.create_order(&order).await;
                return Ok(json!({ "received": true, "outcome": "late" }));
            }
        };

        for (slug, amount) in reserved.iter().filter(|(_, amount)| **amount > 0) {
            let deduction = self
                .retry
                .run("finalize_deduction", || self.inventory.ledger.finalize_deduction(slug, *amount))
                .await;
            match deduction {
                Ok(deduction) => {
                    if let Err(e) = self.cms.update_product_stock(slug, deduction.stock()).await {
                        tracing::warn!(slug = %slug, stock = deduction.stock(), error = %e, "Failed to mirror stock to CMS");
                    }
                }
                Err(e) => {
                    tracing::error!(attempt = %attempt, slug = %slug, amount, error = %e, "Final deduction failed, needs reconciliation");
                }
            }
        }
        self.cancel_schedule(attempt).await;
        self.create_order(&order).await;

        tracing::info!(attempt = %attempt, items = reserved.len(), "Committed reservation");
        Ok(json!({ "received": true, "outcome": "committed" }))
    }

    async fn release(&self, attempt: &AttemptId, metadata: &AttemptMetadata) -> Result<Value> {
        let reserved = match self.claim_reservation(attempt, AttemptOutcome::Released, metadata).await? {
            Settlement::Claimed(reserved) => reserved,
            Settlement::AlreadySettled(previous) => {
                tracing::info!(attempt = %attempt, previous = ?previous, "Attempt already settled, nothing to release");
                self.cancel_schedule(attempt).await;
                return Ok(json!({ "received": true, "outcome": previous.map(|o| o.as_str()) }));
            }
        };

        let unreleased = self.inventory.engine.release(&reserved).await;
        if !unreleased.is_empty() {
            if let Err(e) = self.inventory.scheduler.requeue(attempt, &unreleased).await {
                tracing::error!(attempt = %attempt, unreleased = ?unreleased, error = %e, "Failed to requeue held units, needs reconciliation");
            }
            return Err(StorefrontError::StorageError(format!("{} product(s) could not be released", unreleased.len())));
        }
        self.cancel_schedule(attempt).await;

        tracing::info!(attempt = %attempt, items = reserved.len(), "Released reservation");
        Ok(json!({ "received": true, "outcome": "released" }))
    }

    async fn cancel_schedule(&self, attempt: &AttemptId) {
        if let Err(e) = self.inventory.scheduler.cancel(attempt).await {
            // The reclaim path will find the outcome marker and drop the entry.
            tracing::warn!(attempt = %attempt, error = %e, "Failed to cancel reclaim schedule entry");
        }
    }

    async fn create_order(&self, order: &OrderRecord) {
        if let Err(e) = self.cms.create_order_record(order).await {
            tracing::error!(order_id = %order.order_id, error = %e, "Failed to create order record, needs manual follow-up");
        }
    }
}

/// Intents created by hosted checkout sessions carry no metadata of their
/// own and settle through their session. Older attempts predate the marker.
fn is_storefront_attempt(metadata: &AttemptMetadata) -> bool {
    [CHECKOUT_MARKER, QUANTITIES, RESERVED_IN_STOCK, LEGACY_RESERVED_IN_STOCK]
        .iter()
        .any(|key| metadata.contains_key(*key))
}

fn foreign_intent(event_id: &str, intent_id: &str) -> Value {
    tracing::debug!(event_id = %event_id, payment_intent = %intent_id, "Payment intent without storefront metadata");
    json!({ "received": true, "ignored": "foreign_intent" })
}
