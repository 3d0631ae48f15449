//! Storyblok adapter.
//!
//! Reads go through the published CDN API with the public token; writes
//! (stock mirror, order records) go through the management API of one space.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{Cms, CmsProduct, ProductPage};
use crate::config::CmsConfig;
use crate::domain::order::OrderRecord;
use crate::domain::value_objects::Slug;
use crate::{Result, StorefrontError};

const PRODUCTS_FOLDER: &str = "products";

pub struct StoryblokClient {
    client: Client,
    config: CmsConfig,
}

#[derive(Debug, Deserialize)]
struct Story {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    full_slug: Option<String>,
    #[serde(default)]
    content: Value,
}

impl Story {
    fn product_slug(&self) -> Option<Slug> {
        let raw = if self.slug.is_empty() {
            self.full_slug.as_deref()?.trim_start_matches("products/").to_string()
        } else {
            self.slug.clone()
        };
        Slug::new(raw).ok()
    }

    fn into_product(self) -> Option<CmsProduct> {
        let slug = self.product_slug()?;
        Some(CmsProduct::from_content(slug, Some(self.id), self.name, self.content))
    }
}

#[derive(Deserialize)]
struct StoryResponse { story: Story }

#[derive(Deserialize)]
struct StoriesResponse {
    #[serde(default)]
    stories: Vec<Story>,
}

impl StoriesResponse {
    fn into_page(self) -> ProductPage {
        let mut page = ProductPage::default();
        for story in self.stories {
            let id = story.id;
            match story.into_product() {
                Some(product) => page.products.push(product),
                None => {
                    tracing::warn!(story_id = id, "Product story without a usable slug");
                    page.unusable += 1;
                }
            }
        }
        page
    }
}

fn cms_error(context: &str) -> impl Fn(reqwest::Error) -> StorefrontError + '_ {
    move |e| StorefrontError::CmsError(format!("{context}: {e}"))
}

impl StoryblokClient {
    pub fn new(config: CmsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| StorefrontError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn token(&self) -> Result<&str> {
        self.config
            .token
            .as_deref()
            .ok_or_else(|| StorefrontError::Config("Missing STORYBLOK_TOKEN".into()))
    }

    fn management(&self) -> Result<(&str, &str)> {
        match (self.config.management_token.as_deref(), self.config.space_id.as_deref()) {
            (Some(token), Some(space)) => Ok((token, space)),
            _ => Err(StorefrontError::Config("Missing STORYBLOK_MANAGEMENT_TOKEN or STORYBLOK_SPACE_ID".into())),
        }
    }

    async fn fetch_story(&self, slug: &Slug) -> Result<Option<Story>> {
        let url = format!("{}/v2/cdn/stories/{PRODUCTS_FOLDER}/{slug}", self.config.cdn_base);
        let response = self
            .client
            .get(&url)
            .query(&[("version", "published"), ("token", self.token()?)])
            .send()
            .await
            .map_err(cms_error("CDN request failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: StoryResponse = Self::json(response).await?;
        Ok(Some(body.story))
    }

    async fn management_call(&self, method: reqwest::Method, path: &str, body: Value) -> Result<()> {
        let (token, space) = self.management()?;
        let url = format!("{}/v1/spaces/{space}{path}", self.config.management_base);
        let response = self
            .client
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, token)
            .json(&body)
            .send()
            .await
            .map_err(cms_error("Management API request failed"))?;
        let _: Value = Self::json(response).await?;
        Ok(())
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorefrontError::CmsError(format!("Storyblok error: {status} {body}")));
        }
        response.json().await.map_err(cms_error("Unexpected Storyblok response"))
    }
}

/// Story content for an order, in the field names the CMS schema uses.
pub fn order_content(order: &OrderRecord) -> Value {
    json!({
        "component": "order",
        "order_id": order.order_id,
        "product_slug": order.product_slugs.join(", "),
        "product_slugs": order.product_slugs,
        "status": order.status,
        "quantities": order.quantities,
        "backorder": order.backorder,
        "delivery_method": order.delivery.method,
        "inpost_point": order.delivery.point,
        "customer_name": order.customer.name,
        "email": order.customer.email,
        "phone": order.customer.phone,
        "address_line1": order.customer.address1,
        "postal_code": order.customer.postal_code,
        "city": order.customer.city,
        "country": order.customer.country,
    })
}

#[async_trait]
impl Cms for StoryblokClient {
    async fn get_product(&self, slug: &Slug) -> Result<Option<CmsProduct>> {
        Ok(self.fetch_story(slug).await?.and_then(Story::into_product))
    }

    async fn list_products(&self, page: u32, per_page: u32) -> Result<ProductPage> {
        let url = format!("{}/v2/cdn/stories", self.config.cdn_base);
        let (page, per_page) = (page.to_string(), per_page.to_string());
        let response = self
            .client
            .get(&url)
            .query(&[
                ("starts_with", PRODUCTS_FOLDER),
                ("per_page", per_page.as_str()),
                ("page", page.as_str()),
                ("version", "published"),
                ("token", self.token()?),
            ])
            .send()
            .await
            .map_err(cms_error("CDN request failed"))?;
        let body: StoriesResponse = Self::json(response).await?;
        Ok(body.into_page())
    }

    async fn create_order_record(&self, order: &OrderRecord) -> Result<()> {
        let parent_id: i64 = self
            .config
            .orders_folder_id
            .ok_or_else(|| StorefrontError::Config("Missing STORYBLOK_ORDERS_FOLDER_ID".into()))?;
        let body = json!({
            "story": {
                "name": order.order_id,
                "slug": format!("orders/{}", order.order_id),
                "parent_id": parent_id,
                "content": order_content(order),
            },
            "publish": 0,
        });
        self.management_call(reqwest::Method::POST, "/stories/", body).await?;
        tracing::info!(order_id = %order.order_id, "Created order record");
        Ok(())
    }

    async fn update_product_stock(&self, slug: &Slug, stock: i64) -> Result<()> {
        let story = self
            .fetch_story(slug)
            .await?
            .ok_or_else(|| StorefrontError::ProductNotFound(slug.to_string()))?;
        let mut content = match story.content {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        content.insert("pcs".to_string(), json!(stock));
        let body = json!({
            "story": { "name": story.name, "slug": story.slug, "content": content },
            "publish": 0,
        });
        self.management_call(reqwest::Method::PUT, &format!("/stories/{}", story.id), body).await?;
        tracing::debug!(slug = %slug, stock, "Mirrored stock to CMS");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::checkout::DeliveryMethod;
    use crate::domain::order::{CustomerDetails, Delivery, OrderStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_story_slug_falls_back_to_full_slug() {
        let story: Story = serde_json::from_value(json!({
            "id": 1, "name": "Vase", "slug": "", "full_slug": "products/vase-tall", "content": {"pcs": 1}
        }))
        .unwrap();
        let product = story.into_product().unwrap();
        assert_eq!(product.slug.as_str(), "vase-tall");
        assert_eq!(product.story_id, Some(1));
    }

    #[test]
    fn test_listing_counts_stories_without_slug() {
        let body: StoriesResponse = serde_json::from_value(json!({
            "stories": [
                {"id": 1, "name": "Bowl", "slug": "bowl", "content": {"pcs": 2}},
                {"id": 2, "name": "Draft", "slug": "", "content": {"pcs": 1}},
                {"id": 3, "name": "Bad", "slug": "Not A Slug", "content": {}}
            ]
        }))
        .unwrap();
        let page = body.into_page();
        assert_eq!(page.products.len(), 1);
        assert_eq!(page.unusable, 2);
        assert!(!page.is_empty());
        assert!(ProductPage::default().is_empty());
    }

    #[test]
    fn test_order_content_field_names() {
        let order = OrderRecord {
            order_id: "cs_1".into(),
            status: OrderStatus::Paid,
            product_slugs: vec!["mug-blue".into(), "bowl".into()],
            quantities: BTreeMap::from([("mug-blue".into(), 1), ("bowl".into(), 2)]),
            backorder: BTreeMap::new(),
            customer: CustomerDetails {
                name: "Ola".into(), email: "ola@example.com".into(), phone: "600".into(),
                address1: "Długa 1".into(), postal_code: "31-000".into(), city: "Kraków".into(), country: "PL".into(),
            },
            delivery: Delivery { method: DeliveryMethod::Inpost, point: Some(json!({"name": "KRA01M"})) },
        };
        let content = order_content(&order);
        assert_eq!(content["product_slug"], "mug-blue, bowl");
        assert_eq!(content["status"], "paid");
        assert_eq!(content["delivery_method"], "inpost");
        assert_eq!(content["inpost_point"]["name"], "KRA01M");
        assert_eq!(content["address_line1"], "Długa 1");
    }
}
