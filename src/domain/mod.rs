//! Domain model
pub mod checkout;
pub mod events;
pub mod order;
pub mod value_objects;

pub use checkout::{CheckoutItem, CheckoutLine, CheckoutRequest, Customer, DeliveryMethod};
pub use events::{AttemptId, AttemptMetadata, PaymentEvent, WebhookEvent};
pub use order::{OrderRecord, OrderStatus};
