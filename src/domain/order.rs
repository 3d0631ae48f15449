//! Order record written to the CMS after a successful payment

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::checkout::DeliveryMethod;
use crate::domain::events::{AttemptMetadata, CheckoutSessionObject, PaymentIntentObject};
use crate::inventory::metadata;

const UNKNOWN: &str = "Unknown";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus { #[default] Paid, Shipped, Closed }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub status: OrderStatus,
    pub product_slugs: Vec<String>,
    pub quantities: BTreeMap<String, u32>,
    pub backorder: BTreeMap<String, u32>,
    pub customer: CustomerDetails,
    pub delivery: Delivery,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address1: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub method: DeliveryMethod,
    pub point: Option<serde_json::Value>,
}

fn or_unknown(value: Option<&str>) -> String {
    value.filter(|v| !v.trim().is_empty()).unwrap_or(UNKNOWN).to_string()
}

impl OrderRecord {
    /// Builds the order from a paid hosted checkout session; the processor collected the address.
    pub fn from_checkout_session(session: &CheckoutSessionObject) -> Self {
        let details = session.customer_details.clone().unwrap_or_default();
        let address = details.address.clone().unwrap_or_default();
        let customer = CustomerDetails {
            name: or_unknown(details.name.as_deref()),
            email: or_unknown(details.email.as_deref()),
            phone: or_unknown(details.phone.as_deref()),
            address1: or_unknown(address.line1.as_deref()),
            postal_code: or_unknown(address.postal_code.as_deref()),
            city: or_unknown(address.city.as_deref()),
            country: or_unknown(address.country.as_deref()),
        };
        Self::from_metadata(session.id.clone(), &session.metadata, customer)
    }

    /// Builds the order from a succeeded payment intent; customer data comes from our own metadata.
    pub fn from_payment_intent(intent: &PaymentIntentObject) -> Self {
        let m = &intent.metadata;
        let field = |key: &str| or_unknown(m.get(key).map(String::as_str));
        let customer = CustomerDetails {
            name: field("customer_name"),
            email: field("customer_email"),
            phone: field("customer_phone"),
            address1: field("shipping_street"),
            postal_code: field("shipping_postal_code"),
            city: field("shipping_city"),
            country: field("shipping_country"),
        };
        Self::from_metadata(intent.id.clone(), m, customer)
    }

    fn from_metadata(order_id: String, m: &AttemptMetadata, customer: CustomerDetails) -> Self {
        let quantities = metadata::parse_quantities(m.get(metadata::QUANTITIES).map(String::as_str));
        let mut product_slugs = metadata::parse_slug_list(m.get(metadata::PRODUCT_SLUGS).map(String::as_str));
        if product_slugs.is_empty() {
            product_slugs = quantities.keys().cloned().collect();
        }
        let method = m.get(metadata::DELIVERY_METHOD).cloned().map(DeliveryMethod::from).unwrap_or_default();
        let point = m
            .get(metadata::DELIVERY_POINT)
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .filter(|v| !v.is_null());
        Self {
            order_id,
            status: OrderStatus::Paid,
            product_slugs,
            quantities,
            backorder: metadata::parse_quantities(m.get(metadata::BACKORDER).map(String::as_str)),
            customer,
            delivery: Delivery { method, point },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{SessionAddress, SessionCustomerDetails};

    #[test]
    fn test_order_from_session_fills_unknowns() {
        let mut session = CheckoutSessionObject { id: "cs_1".into(), payment_status: Some("paid".into()), ..Default::default() };
        session.metadata.insert("quantities".into(), r#"{"mug-blue":2}"#.into());
        session.metadata.insert("delivery_method".into(), "inpost".into());
        session.metadata.insert("delivery_point".into(), r#"{"name":"KRA01M"}"#.into());
        session.customer_details = Some(SessionCustomerDetails {
            email: Some("ola@example.com".into()),
            address: Some(SessionAddress { city: Some("Kraków".into()), ..Default::default() }),
            ..Default::default()
        });

        let order = OrderRecord::from_checkout_session(&session);
        assert_eq!(order.order_id, "cs_1");
        assert_eq!(order.product_slugs, vec!["mug-blue".to_string()]);
        assert_eq!(order.customer.email, "ola@example.com");
        assert_eq!(order.customer.name, "Unknown");
        assert_eq!(order.customer.city, "Kraków");
        assert_eq!(order.delivery.method, DeliveryMethod::Inpost);
        assert_eq!(order.delivery.point, Some(serde_json::json!({"name": "KRA01M"})));
    }

    #[test]
    fn test_order_from_intent_uses_own_metadata() {
        let mut intent = PaymentIntentObject { id: "pi_1".into(), ..Default::default() };
        intent.metadata.insert("customer_email".into(), "jan@example.com".into());
        intent.metadata.insert("shipping_city".into(), "Gdańsk".into());
        intent.metadata.insert("product_slugs".into(), r#"["vase","bowl"]"#.into());
        intent.metadata.insert("backorder".into(), r#"{"vase":1}"#.into());

        let order = OrderRecord::from_payment_intent(&intent);
        assert_eq!(order.customer.email, "jan@example.com");
        assert_eq!(order.customer.city, "Gdańsk");
        assert_eq!(order.product_slugs, vec!["vase".to_string(), "bowl".to_string()]);
        assert_eq!(order.backorder.get("vase"), Some(&1));
        assert_eq!(order.delivery.method, DeliveryMethod::Courier);
    }
}
