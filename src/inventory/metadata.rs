//! Loosely-typed reservation payloads.
//!
//! Reservation maps travel as JSON strings in two places: the store-side
//! reservation record and the payment attempt's own metadata. Both are read
//! with total parse-with-fallback semantics: malformed input yields an empty
//! mapping, bad entries are dropped, nothing here returns an error.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::events::AttemptMetadata;
use crate::domain::value_objects::Slug;

/// Set on every attempt this storefront creates. Short enough to never be dropped.
pub const CHECKOUT_MARKER: &str = "storefront_checkout";
pub const RESERVED_IN_STOCK: &str = "reserved_in_stock";
pub const LEGACY_RESERVED_IN_STOCK: &str = "reservedInStock";
pub const QUANTITIES: &str = "quantities";
pub const BACKORDER: &str = "backorder";
pub const PRODUCT_SLUGS: &str = "product_slugs";
pub const DELIVERY_METHOD: &str = "delivery_method";
pub const DELIVERY_POINT: &str = "delivery_point";
pub const CART_ITEMS: &str = "cart_items_compact";

/// Units held in stock per product for one attempt.
pub type ReservedStock = BTreeMap<Slug, u32>;

/// The shapes a reservation payload has been written in.
#[derive(Debug)]
enum ReservationPayload<'a> {
    /// `{"reservedInStockBySlug": {...}}`, the store record.
    Record(&'a Value),
    /// `{"slug": n, ...}`, the attempt metadata.
    Bare(&'a serde_json::Map<String, Value>),
    Unusable,
}

impl<'a> ReservationPayload<'a> {
    fn classify(value: &'a Value) -> Self {
        match value {
            Value::Object(map) => match map.get("reservedInStockBySlug") {
                Some(inner) => Self::Record(inner),
                None => Self::Bare(map),
            },
            _ => Self::Unusable,
        }
    }
}

fn parse_json(raw: Option<&str>) -> Value {
    raw.filter(|r| !r.trim().is_empty())
        .and_then(|r| serde_json::from_str(r).ok())
        .unwrap_or(Value::Null)
}

fn amount(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn amounts(map: &serde_json::Map<String, Value>) -> BTreeMap<String, u32> {
    map.iter().filter_map(|(k, v)| amount(v).map(|n| (k.clone(), n))).collect()
}

fn to_reserved(map: BTreeMap<String, u32>) -> ReservedStock {
    map.into_iter().filter_map(|(k, v)| Slug::new(k).ok().map(|slug| (slug, v))).collect()
}

/// Parses a reservation record or a bare `slug -> units` map.
pub fn parse_reserved(raw: Option<&str>) -> ReservedStock {
    let value = parse_json(raw);
    match ReservationPayload::classify(&value) {
        ReservationPayload::Record(Value::Object(inner)) => to_reserved(amounts(inner)),
        ReservationPayload::Record(_) | ReservationPayload::Unusable => ReservedStock::new(),
        ReservationPayload::Bare(map) => to_reserved(amounts(map)),
    }
}

/// Reads the reserved-in-stock map from payment attempt metadata.
pub fn reserved_from_attempt(metadata: &AttemptMetadata) -> ReservedStock {
    let raw = metadata
        .get(RESERVED_IN_STOCK)
        .or_else(|| metadata.get(LEGACY_RESERVED_IN_STOCK))
        .map(String::as_str);
    parse_reserved(raw)
}

pub fn parse_quantities(raw: Option<&str>) -> BTreeMap<String, u32> {
    match parse_json(raw) {
        Value::Object(map) => amounts(&map),
        _ => BTreeMap::new(),
    }
}

pub fn parse_slug_list(raw: Option<&str>) -> Vec<String> {
    match parse_json(raw) {
        Value::Array(items) => items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

/// Serialises a `slug -> units` map for metadata fields.
pub fn encode_map(map: &BTreeMap<Slug, u32>) -> String {
    let plain: BTreeMap<&str, u32> = map.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    serde_json::to_string(&plain).unwrap_or_else(|_| "{}".to_string())
}
