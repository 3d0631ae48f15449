//! HTTP surface

mod error;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::checkout::{CheckoutService, CheckoutSessionStarted, PaymentIntentStarted, ProductAvailability};
use crate::domain::checkout::CheckoutRequest;
use crate::domain::value_objects::Slug;
use crate::payments::PaymentIntentStatus;
use crate::settlement::SettlementHandler;
use crate::sync::StockSync;
use crate::{Result, StorefrontError};

const SIGNATURE_HEADER: &str = "stripe-signature";
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,
    pub settlement: Arc<SettlementHandler>,
    pub sync: Arc<StockSync>,
    pub admin_token: Option<String>,
    pub public_origin: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "ceramics-storefront"})) }))
        .route("/api/products/:slug", get(get_product))
        .route("/api/checkout/start", post(start_checkout))
        .route("/api/checkout/create-payment-intent", post(create_payment_intent))
        .route("/api/checkout/submit", post(submit_payment))
        .route("/api/stripe/webhook", post(stripe_webhook))
        .route("/api/admin/sync-stock", post(sync_stock))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}

fn checkout_body(body: std::result::Result<Json<CheckoutRequest>, JsonRejection>) -> Result<CheckoutRequest> {
    body.map(|Json(request)| request)
        .map_err(|rejection| StorefrontError::Validation(format!("Invalid request: {}", rejection.body_text())))
}

/// Origin for redirect URLs: configured, else taken from proxy or host headers.
fn request_origin(configured: Option<&str>, headers: &HeaderMap) -> Result<String> {
    if let Some(origin) = configured {
        return Ok(origin.to_string());
    }
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty());
    let host = value("x-forwarded-host")
        .or_else(|| value(header::HOST.as_str()))
        .ok_or_else(|| StorefrontError::Validation("Missing Host header".into()))?;
    let proto = value("x-forwarded-proto").unwrap_or("http");
    Ok(format!("{proto}://{host}"))
}

async fn get_product(State(s): State<AppState>, Path(slug): Path<String>) -> Result<Json<ProductAvailability>> {
    let slug = Slug::new(slug).map_err(|e| StorefrontError::Validation(format!("Invalid slug: {e}")))?;
    Ok(Json(s.checkout.product_availability(&slug).await?))
}

async fn start_checkout(
    State(s): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutSessionStarted>> {
    let request = checkout_body(body)?;
    let origin = request_origin(s.public_origin.as_deref(), &headers)?;
    Ok(Json(s.checkout.start_checkout_session(&request, &origin).await?))
}

async fn create_payment_intent(
    State(s): State<AppState>,
    body: std::result::Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<PaymentIntentStarted>> {
    let request = checkout_body(body)?;
    Ok(Json(s.checkout.create_payment_intent(&request).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(default)]
    payment_intent_id: Option<String>,
}

async fn submit_payment(
    State(s): State<AppState>,
    body: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<PaymentIntentStatus>> {
    let Json(body) = body.unwrap_or_default();
    let id = body.payment_intent_id.unwrap_or_default();
    Ok(Json(s.checkout.payment_status(&id).await?))
}

async fn stripe_webhook(State(s): State<AppState>, headers: HeaderMap, body: String) -> impl IntoResponse {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let response = s.settlement.handle_event(&body, signature).await;
    (response.status, Json(response.body))
}

fn admin_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer.or_else(|| headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()))
}

async fn sync_stock(State(s): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    let expected = s
        .admin_token
        .as_deref()
        .ok_or_else(|| StorefrontError::Config("Missing ADMIN_SYNC_TOKEN".into()))?;
    if admin_token(&headers) != Some(expected) {
        return Err(StorefrontError::Unauthorized);
    }
    let summary = s.sync.run().await?;
    Ok((StatusCode::OK, Json(json!({ "ok": true, "summary": summary }))))
}
