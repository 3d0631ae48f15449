//! Configuration management.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub payments: PaymentsConfig,
    pub cms: CmsConfig,
    pub checkout: CheckoutConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin used for checkout success/cancel URLs; falls back to request headers.
    pub public_origin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub signature_tolerance: Duration,
}

impl PaymentsConfig {
    /// Unset or blank secrets. Webhooks cannot be verified without them.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.secret_key.trim().is_empty() { missing.push("STRIPE_SECRET_KEY"); }
        if self.webhook_secret.trim().is_empty() { missing.push("STRIPE_WEBHOOK_SECRET"); }
        missing
    }
}

#[derive(Debug, Clone)]
pub struct CmsConfig {
    /// Public CDN token for reads.
    pub token: Option<String>,
    pub management_token: Option<String>,
    pub space_id: Option<String>,
    pub orders_folder_id: Option<i64>,
    pub cdn_base: String,
    pub management_base: String,
}

/// Reservation and settlement timing.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub currency: String,
    pub shipping_countries: Vec<String>,
    /// How long a checkout attempt holds stock.
    pub reservation_ttl: Duration,
    /// Extra lifetime of the reservation record past `reservation_ttl`.
    pub record_grace: Duration,
    /// Lifetime of event and attempt idempotency markers.
    pub processed_ttl: Duration,
    /// `None` disables the periodic sweeper.
    pub sweep_interval: Option<Duration>,
}

impl CheckoutConfig {
    pub fn record_ttl(&self) -> Duration { self.reservation_ttl + self.record_grace }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            currency: "pln".to_string(),
            shipping_countries: ["PL", "CZ", "DE", "SK", "AT"].iter().map(|c| c.to_string()).collect(),
            reservation_ttl: Duration::from_secs(30 * 60),
            record_grace: Duration::from_secs(24 * 60 * 60),
            processed_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    pub sync_token: Option<String>,
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = CheckoutConfig::default();
        Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parsed("PORT", 8083),
                public_origin: non_empty("PUBLIC_ORIGIN").map(|o| o.trim_end_matches('/').to_string()),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            payments: PaymentsConfig {
                secret_key: non_empty("STRIPE_SECRET_KEY").unwrap_or_default(),
                webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
                api_base: env::var("STRIPE_API_BASE").unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                signature_tolerance: Duration::from_secs(parsed("STRIPE_SIGNATURE_TOLERANCE_SECS", 300)),
            },
            cms: CmsConfig {
                token: non_empty("STORYBLOK_TOKEN"),
                management_token: non_empty("STORYBLOK_MANAGEMENT_TOKEN"),
                space_id: non_empty("STORYBLOK_SPACE_ID"),
                orders_folder_id: non_empty("STORYBLOK_ORDERS_FOLDER_ID").and_then(|s| s.parse().ok()),
                cdn_base: env::var("STORYBLOK_CDN_BASE").unwrap_or_else(|_| "https://api.storyblok.com".to_string()),
                management_base: env::var("STORYBLOK_MANAGEMENT_BASE")
                    .unwrap_or_else(|_| "https://mapi.storyblok.com".to_string()),
            },
            checkout: CheckoutConfig {
                currency: parsed("CHECKOUT_CURRENCY", defaults.currency.clone()).to_lowercase(),
                shipping_countries: non_empty("SHIPPING_COUNTRIES")
                    .map(|s| s.split(',').map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()).collect())
                    .unwrap_or(defaults.shipping_countries),
                reservation_ttl: Duration::from_secs(parsed("RESERVATION_TTL_SECS", defaults.reservation_ttl.as_secs())),
                record_grace: Duration::from_secs(parsed(
                    "RESERVATION_RECORD_GRACE_SECS",
                    defaults.record_grace.as_secs(),
                )),
                processed_ttl: Duration::from_secs(parsed("PROCESSED_EVENT_TTL_SECS", defaults.processed_ttl.as_secs())),
                sweep_interval: match parsed("RECLAIM_SWEEP_INTERVAL_SECS", 60u64) {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
            admin: AdminConfig { sync_token: non_empty("ADMIN_SYNC_TOKEN") },
        }
    }

    /// Names of settings a production deployment cannot run without.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = self.payments.missing();
        if self.cms.token.is_none() { missing.push("STORYBLOK_TOKEN"); }
        missing
    }
}
