//! Ceramics Storefront - checkout and stock settlement backend

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ceramics_storefront::api::{self, AppState};
use ceramics_storefront::checkout::CheckoutService;
use ceramics_storefront::cms::storyblok::StoryblokClient;
use ceramics_storefront::inventory::Inventory;
use ceramics_storefront::payments::stripe::StripeClient;
use ceramics_storefront::settlement::SettlementHandler;
use ceramics_storefront::store::redis::RedisStore;
use ceramics_storefront::store::AtomicStore;
use ceramics_storefront::sync::StockSync;
use ceramics_storefront::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,ceramics_storefront=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let missing = config.missing_required();
    if !missing.is_empty() {
        tracing::error!(?missing, "Required settings are not configured");
        anyhow::bail!("missing required settings: {}", missing.join(", "));
    }

    let redis = RedisStore::connect(&config.redis.url).await.context("connecting to redis")?;
    redis.ping().await.context("pinging redis")?;
    tracing::info!("Connected to Redis");
    let store: Arc<dyn AtomicStore> = Arc::new(redis);
    let inventory = Inventory::new(store.clone(), config.checkout.processed_ttl);
    let payments = Arc::new(StripeClient::new(&config.payments)?);
    let cms = Arc::new(StoryblokClient::new(config.cms.clone())?);

    let sweeper = config.checkout.sweep_interval.map(|period| inventory.scheduler.spawn_sweeper(period));

    let state = AppState {
        checkout: Arc::new(CheckoutService::new(inventory.clone(), payments.clone(), cms.clone(), config.checkout.clone())),
        settlement: Arc::new(SettlementHandler::new(
            store.clone(),
            inventory.clone(),
            payments,
            cms.clone(),
            config.checkout.processed_ttl,
        )),
        sync: Arc::new(StockSync::new(store, inventory.ledger.clone(), cms)),
        admin_token: config.admin.sync_token.clone(),
        public_origin: config.server.public_origin.clone(),
    };
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("🚀 Ceramics storefront listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}
