//! Headless CMS boundary

pub mod storyblok;

pub use self::storyblok::StoryblokClient;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::domain::order::OrderRecord;
use crate::domain::value_objects::Slug;
use crate::Result;

/// Product as published in the CMS. `stock` mirrors the ledger and is only
/// authoritative for seeding and admin sync.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CmsProduct {
    pub slug: Slug,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<i64>,
    pub name: String,
    pub stock: Option<i64>,
    pub price: Option<Decimal>,
    pub content: Value,
}

impl CmsProduct {
    /// Reads `pcs` and `price_pln` out of a story's content. Absent or non-numeric fields become `None`.
    pub fn from_content(slug: Slug, story_id: Option<i64>, name: String, content: Value) -> Self {
        let stock = content.get("pcs").and_then(whole_number);
        let price = content.get("price_pln").and_then(decimal);
        Self { slug, story_id, name, stock, price, content }
    }
}

/// One page of the product listing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProductPage {
    pub products: Vec<CmsProduct>,
    /// Product stories on this page without a usable slug.
    pub unusable: u32,
}

impl ProductPage {
    pub fn is_empty(&self) -> bool { self.products.is_empty() && self.unusable == 0 }
}

fn whole_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.as_i64().map(Decimal::from).or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
pub trait Cms: Send + Sync {
    /// `None` when the CMS has no published product under `slug`.
    async fn get_product(&self, slug: &Slug) -> Result<Option<CmsProduct>>;

    /// One page of products, 1-based. An empty page ends the listing.
    async fn list_products(&self, page: u32, per_page: u32) -> Result<ProductPage>;

    async fn create_order_record(&self, order: &OrderRecord) -> Result<()>;

    async fn update_product_stock(&self, slug: &Slug, stock: i64) -> Result<()>;
}
