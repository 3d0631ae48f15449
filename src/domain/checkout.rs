//! Checkout request

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

use crate::domain::value_objects::{Money, Slug};
use crate::{Result, StorefrontError};

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 50))]
    #[serde(default)]
    pub items: Vec<CheckoutItem>,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    #[serde(default, alias = "inpostPoint")]
    pub delivery_point: Option<serde_json::Value>,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub allow_backorder: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    #[validate(length(min = 1))]
    #[serde(alias = "productSlug")]
    pub slug: String,
    #[validate(length(min = 1))]
    #[serde(alias = "productName")]
    pub name: String,
    #[serde(alias = "pricePLN")]
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 { 1 }

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl Customer {
    /// Direct card payments carry no hosted address form, so contact details are mandatory.
    pub fn has_contact_details(&self) -> bool {
        [&self.email, &self.phone, &self.postal_code, &self.street, &self.city]
            .iter()
            .all(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeliveryMethod {
    #[default]
    Courier,
    Inpost,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Courier => "courier", Self::Inpost => "inpost" }
    }
}

impl From<String> for DeliveryMethod {
    fn from(value: String) -> Self {
        if value == "inpost" { Self::Inpost } else { Self::Courier }
    }
}

impl From<DeliveryMethod> for String {
    fn from(method: DeliveryMethod) -> Self { method.as_str().to_string() }
}

/// A validated checkout line.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckoutLine {
    pub slug: Slug,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl CheckoutLine {
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity) }
}

impl CheckoutRequest {
    /// Validates the request and returns its lines priced in `currency`.
    /// Nothing is reserved before this succeeds.
    pub fn lines(&self, currency: &str) -> Result<Vec<CheckoutLine>> {
        self.validate()?;
        if let Some(customer) = &self.customer { customer.validate()?; }

        let mut seen = BTreeSet::new();
        let mut lines = Vec::with_capacity(self.items.len());
        for item in &self.items {
            item.validate()?;
            let slug = Slug::new(item.slug.as_str())
                .map_err(|e| StorefrontError::Validation(format!("item {}: {e}", item.slug)))?;
            if item.unit_price <= Decimal::ZERO {
                return Err(StorefrontError::Validation(format!("item {slug}: price must be positive")));
            }
            if !seen.insert(slug.clone()) {
                return Err(StorefrontError::Validation(format!("item {slug} listed more than once")));
            }
            let quantity = u32::try_from(item.quantity)
                .map_err(|_| StorefrontError::Validation(format!("item {slug}: invalid quantity")))?;
            lines.push(CheckoutLine { slug, name: item.name.clone(), unit_price: Money::new(item.unit_price, currency), quantity });
        }
        Ok(lines)
    }
}

/// Sum of line totals in minor units; must be positive.
pub fn total_minor_units(lines: &[CheckoutLine]) -> Result<i64> {
    let mut total: i64 = 0;
    for line in lines {
        let minor = line.line_total().minor_units().map_err(|e| StorefrontError::Validation(e.to_string()))?;
        total = total.checked_add(minor).ok_or_else(|| StorefrontError::Validation("amount out of range".into()))?;
    }
    if total <= 0 { return Err(StorefrontError::Validation("Invalid amount".into())); }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> CheckoutRequest { serde_json::from_value(json).unwrap() }

    #[test]
    fn test_lines_accept_both_field_spellings() {
        let req = request(serde_json::json!({
            "items": [
                {"slug": "mug-blue", "name": "Blue mug", "unitPrice": 89.5, "quantity": 2},
                {"productSlug": "bowl", "productName": "Bowl", "pricePLN": 120}
            ],
            "deliveryMethod": "inpost"
        }));
        let lines = req.lines("pln").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].quantity, 1);
        assert_eq!(req.delivery_method, DeliveryMethod::Inpost);
        assert_eq!(total_minor_units(&lines).unwrap(), 2 * 8950 + 12000);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let empty = request(serde_json::json!({"items": []}));
        assert!(matches!(empty.lines("pln"), Err(StorefrontError::Validation(_))));

        let zero_qty = request(serde_json::json!({"items": [{"slug": "a", "name": "A", "unitPrice": 1, "quantity": 0}]}));
        assert!(zero_qty.lines("pln").is_err());

        let free = request(serde_json::json!({"items": [{"slug": "a", "name": "A", "unitPrice": 0}]}));
        assert!(free.lines("pln").is_err());

        let dup = request(serde_json::json!({"items": [
            {"slug": "a", "name": "A", "unitPrice": 1}, {"slug": "a", "name": "A", "unitPrice": 1}
        ]}));
        assert!(dup.lines("pln").is_err());

        let bad_email = request(serde_json::json!({
            "items": [{"slug": "a", "name": "A", "unitPrice": 1}],
            "customer": {"email": "not-an-email"}
        }));
        assert!(bad_email.lines("pln").is_err());
    }

    #[test]
    fn test_unknown_delivery_method_falls_back_to_courier() {
        let req = request(serde_json::json!({"items": [], "deliveryMethod": "drone"}));
        assert_eq!(req.delivery_method, DeliveryMethod::Courier);
    }

    #[test]
    fn test_contact_details() {
        let mut customer = Customer {
            email: Some("a@b.pl".into()), phone: Some("+48 600".into()), street: Some("Długa 1".into()),
            postal_code: Some("31-000".into()), city: Some("Kraków".into()), ..Default::default()
        };
        assert!(customer.has_contact_details());
        customer.city = Some("  ".into());
        assert!(!customer.has_contact_details());
    }
}
