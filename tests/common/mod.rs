//! Shared fixtures: in-memory store with fault injection, fake payment
//! processor and fake CMS wired into the real services.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ceramics_storefront::api::AppState;
use ceramics_storefront::checkout::CheckoutService;
use ceramics_storefront::cms::{Cms, CmsProduct, ProductPage};
use ceramics_storefront::config::CheckoutConfig;
use ceramics_storefront::domain::checkout::CheckoutRequest;
use ceramics_storefront::domain::events::{AttemptMetadata, WebhookEvent};
use ceramics_storefront::domain::order::OrderRecord;
use ceramics_storefront::inventory::Inventory;
use ceramics_storefront::payments::stripe::{sign_payload, verify_signature};
use ceramics_storefront::payments::{
    CheckoutSessionRequest, CreatedCheckoutSession, CreatedPaymentIntent, PaymentIntentRequest, PaymentIntentStatus,
    PaymentProcessor,
};
use ceramics_storefront::settlement::{SettlementHandler, WebhookResponse};
use ceramics_storefront::store::memory::InMemoryStore;
use ceramics_storefront::store::{AtomicStore, RetryPolicy, Script, SetOptions};
use ceramics_storefront::sync::StockSync;
use ceramics_storefront::{Result, Slug, StorefrontError};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_TOKEN: &str = "admin-secret";

pub fn slug(s: &str) -> Slug {
    Slug::new(s).unwrap()
}

// =============================================================================
// Store with fault injection
// =============================================================================

#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    /// Number of upcoming `take` calls that fail.
    pub failing_takes: AtomicU32,
    /// Fails writes of reservation records.
    pub fail_record_saves: AtomicBool,
    /// Number of upcoming `Release` script calls that fail.
    pub failing_releases: AtomicU32,
    /// Fails every reclaim schedule write.
    pub fail_zadds: AtomicBool,
}

fn consume(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

fn injected() -> StorefrontError {
    StorefrontError::StorageError("injected failure".into())
}

#[async_trait]
impl AtomicStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let is_record = key.starts_with("reserve:session:") || key.starts_with("reserve:payment_intent:");
        if is_record && self.fail_record_saves.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.set(key, value, options).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.inner.incr_by(key, delta).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.inner.del(key).await
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        if consume(&self.failing_takes) {
            return Err(injected());
        }
        self.inner.take(key).await
    }

    async fn eval(&self, script: Script, keys: &[&str], args: &[i64]) -> Result<Vec<i64>> {
        if script == Script::Release && consume(&self.failing_releases) {
            return Err(injected());
        }
        self.inner.eval(script, keys, args).await
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        if self.fail_zadds.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.zadd(set, score, member).await
    }

    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        self.inner.zrange_by_score(set, min, max).await
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        self.inner.zrem(set, member).await
    }
}

// =============================================================================
// Payment processor
// =============================================================================

#[derive(Default)]
pub struct FakePayments {
    next_id: AtomicU32,
    pub intents: Mutex<Vec<(String, PaymentIntentRequest)>>,
    pub sessions: Mutex<Vec<(String, CheckoutSessionRequest)>>,
    pub fail_creation: AtomicBool,
}

impl FakePayments {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn intent_metadata(&self, id: &str) -> AttemptMetadata {
        let intents = self.intents.lock().unwrap();
        intents.iter().find(|(i, _)| i == id).map(|(_, r)| r.metadata.clone()).unwrap()
    }

    pub fn session_request(&self, id: &str) -> CheckoutSessionRequest {
        let sessions = self.sessions.lock().unwrap();
        sessions.iter().find(|(i, _)| i == id).map(|(_, r)| r.clone()).unwrap()
    }
}

#[async_trait]
impl PaymentProcessor for FakePayments {
    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> Result<CreatedPaymentIntent> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(StorefrontError::PaymentError("card processor unavailable".into()));
        }
        let id = self.next("pi");
        self.intents.lock().unwrap().push((id.clone(), request));
        Ok(CreatedPaymentIntent { client_secret: format!("{id}_secret"), id })
    }

    async fn create_checkout_session(&self, request: CheckoutSessionRequest) -> Result<CreatedCheckoutSession> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(StorefrontError::PaymentError("checkout unavailable".into()));
        }
        let id = self.next("cs");
        self.sessions.lock().unwrap().push((id.clone(), request));
        Ok(CreatedCheckoutSession { url: format!("https://pay.test/{id}"), id })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntentStatus> {
        let intents = self.intents.lock().unwrap();
        let (_, request) = intents
            .iter()
            .find(|(i, _)| i == id)
            .ok_or_else(|| StorefrontError::PaymentError(format!("No such payment_intent: {id}")))?;
        Ok(PaymentIntentStatus {
            id: id.to_string(),
            status: "requires_payment_method".into(),
            amount: request.amount_minor,
            currency: request.currency.clone(),
        })
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> Result<WebhookEvent> {
        verify_signature(payload, signature, WEBHOOK_SECRET, Duration::from_secs(300), Utc::now().timestamp())?;
        WebhookEvent::from_json(payload).map_err(|e| StorefrontError::Validation(format!("Malformed event: {e}")))
    }
}

// =============================================================================
// CMS
// =============================================================================

#[derive(Default)]
pub struct FakeCms {
    products: Mutex<BTreeMap<Slug, CmsProduct>>,
    pub orders: Mutex<Vec<OrderRecord>>,
    pub stock_updates: Mutex<Vec<(Slug, i64)>>,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Product stories without a usable slug, listed on the first page.
    pub unusable_stories: AtomicU32,
}

impl FakeCms {
    pub fn put_product(&self, name: &str, pcs: Option<i64>) {
        let mut products = self.products.lock().unwrap();
        let id = products.len() as i64 + 1;
        let content = match pcs {
            Some(pcs) => json!({ "pcs": pcs, "price_pln": 89.5 }),
            None => json!({ "price_pln": 89.5 }),
        };
        products.insert(slug(name), CmsProduct::from_content(slug(name), Some(id), name.to_string(), content));
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.orders.lock().unwrap().clone()
    }

    pub fn stock_updates(&self) -> Vec<(Slug, i64)> {
        self.stock_updates.lock().unwrap().clone()
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorefrontError::CmsError("CMS unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cms for FakeCms {
    async fn get_product(&self, slug: &Slug) -> Result<Option<CmsProduct>> {
        self.check(&self.fail_reads)?;
        Ok(self.products.lock().unwrap().get(slug).cloned())
    }

    async fn list_products(&self, page: u32, per_page: u32) -> Result<ProductPage> {
        self.check(&self.fail_reads)?;
        let products = self.products.lock().unwrap();
        let skip = (page.saturating_sub(1) * per_page) as usize;
        Ok(ProductPage {
            products: products.values().skip(skip).take(per_page as usize).cloned().collect(),
            unusable: if page == 1 { self.unusable_stories.load(Ordering::SeqCst) } else { 0 },
        })
    }

    async fn create_order_record(&self, order: &OrderRecord) -> Result<()> {
        self.check(&self.fail_writes)?;
        self.orders.lock().unwrap().push(order.clone());
        Ok(())
    }

    async fn update_product_stock(&self, slug: &Slug, stock: i64) -> Result<()> {
        self.check(&self.fail_writes)?;
        self.stock_updates.lock().unwrap().push((slug.clone(), stock));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub inventory: Inventory,
    pub payments: Arc<FakePayments>,
    pub cms: Arc<FakeCms>,
    pub config: CheckoutConfig,
    pub checkout: Arc<CheckoutService>,
    pub settlement: Arc<SettlementHandler>,
    pub sync: Arc<StockSync>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(FlakyStore::default());
        let dyn_store: Arc<dyn AtomicStore> = store.clone();
        let config = CheckoutConfig { sweep_interval: None, ..CheckoutConfig::default() };
        let inventory = Inventory::new(dyn_store.clone(), config.processed_ttl);
        let payments = Arc::new(FakePayments::default());
        let cms = Arc::new(FakeCms::default());

        let retry = RetryPolicy::new().with_initial_delay(Duration::from_millis(1));
        let checkout = CheckoutService::new(inventory.clone(), payments.clone(), cms.clone(), config.clone())
            .with_retry(retry.clone());
        let settlement =
            SettlementHandler::new(dyn_store.clone(), inventory.clone(), payments.clone(), cms.clone(), config.processed_ttl)
                .with_retry(retry);
        let sync = StockSync::new(dyn_store, inventory.ledger.clone(), cms.clone());

        Self {
            store,
            inventory,
            payments,
            cms,
            config,
            checkout: Arc::new(checkout),
            settlement: Arc::new(settlement),
            sync: Arc::new(sync),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            checkout: self.checkout.clone(),
            settlement: self.settlement.clone(),
            sync: self.sync.clone(),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            public_origin: None,
        }
    }

    /// `(stock, reserve)` for a product.
    pub async fn levels(&self, name: &str) -> (i64, i64) {
        let levels = self.inventory.ledger.levels(&slug(name)).await.unwrap();
        (levels.stock, levels.reserve)
    }

    pub async fn deliver(&self, body: &str) -> WebhookResponse {
        self.settlement.handle_event(body, Some(&signed(body))).await
    }
}

// =============================================================================
// Requests and events
// =============================================================================

pub fn checkout_request(items: &[(&str, u32)], allow_backorder: bool) -> CheckoutRequest {
    serde_json::from_value(checkout_body(items, allow_backorder)).unwrap()
}

pub fn checkout_body(items: &[(&str, u32)], allow_backorder: bool) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|(name, qty)| json!({ "slug": name, "name": name, "unitPrice": 89.5, "quantity": qty }))
        .collect();
    json!({
        "items": items,
        "deliveryMethod": "courier",
        "allowBackorder": allow_backorder,
        "customer": {
            "email": "ola@example.com",
            "phone": "+48600100200",
            "name": "Ola Nowak",
            "street": "Długa 1",
            "postalCode": "31-147",
            "city": "Kraków"
        }
    })
}

pub fn signed(body: &str) -> String {
    sign_payload(body, WEBHOOK_SECRET, Utc::now().timestamp()).unwrap()
}

pub fn event(id: &str, kind: &str, object: Value) -> String {
    json!({ "id": id, "type": kind, "data": { "object": object } }).to_string()
}

pub fn intent_succeeded(event_id: &str, intent_id: &str, metadata: &AttemptMetadata) -> String {
    event(event_id, "payment_intent.succeeded", json!({ "id": intent_id, "amount": 17900, "currency": "pln", "metadata": metadata }))
}

pub fn intent_failed(event_id: &str, intent_id: &str, metadata: &AttemptMetadata) -> String {
    event(event_id, "payment_intent.payment_failed", json!({ "id": intent_id, "metadata": metadata }))
}

pub fn session_completed(event_id: &str, session_id: &str, paid: bool, metadata: &AttemptMetadata) -> String {
    event(
        event_id,
        "checkout.session.completed",
        json!({
            "id": session_id,
            "payment_status": if paid { "paid" } else { "unpaid" },
            "metadata": metadata,
            "customer_details": {
                "name": "Jan Kowalski",
                "email": "jan@example.com",
                "phone": "+48500100200",
                "address": { "line1": "Rynek 1", "postal_code": "50-101", "city": "Wrocław", "country": "PL" }
            }
        }),
    )
}

pub fn session_expired(event_id: &str, session_id: &str, metadata: &AttemptMetadata) -> String {
    event(event_id, "checkout.session.expired", json!({ "id": session_id, "metadata": metadata }))
}
