//! Admin stock sync from the CMS.
//!
//! The CMS is only trusted to raise stock (restocks). A CMS value below the
//! ledger is reported as drift and left alone: the ledger already reflects
//! sales the CMS mirror may not have caught up with.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cms::Cms;
use crate::inventory::{StockLedger, StockRaise};
use crate::store::{keys, AtomicStore, SetOptions};
use crate::{Result, StorefrontError};

const PER_PAGE: u32 = 100;
const LOCK_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub updated: u32,
    pub restocked: u32,
    pub skipped: u32,
    pub drift: u32,
    pub missing_stock: u32,
    pub total: u32,
}

pub struct StockSync {
    store: Arc<dyn AtomicStore>,
    ledger: StockLedger,
    cms: Arc<dyn Cms>,
}

impl StockSync {
    pub fn new(store: Arc<dyn AtomicStore>, ledger: StockLedger, cms: Arc<dyn Cms>) -> Self {
        Self { store, ledger, cms }
    }

    /// Runs one sync under the global sync lock.
    ///
    /// # Errors
    ///
    /// `Conflict` if another sync holds the lock; CMS or store errors abort the run.
    pub async fn run(&self) -> Result<SyncSummary> {
        let locked = self
            .store
            .set(keys::STOCK_SYNC_LOCK, "1", SetOptions::nx().with_ttl(LOCK_TTL))
            .await?;
        if !locked {
            return Err(StorefrontError::Conflict("Sync already running".into()));
        }

        let result = self.sync_all().await;
        if let Err(e) = self.store.del(keys::STOCK_SYNC_LOCK).await {
            tracing::error!(error = %e, "Failed to release stock sync lock");
        }
        let summary = result?;
        tracing::info!(?summary, "Stock sync finished");
        Ok(summary)
    }

    async fn sync_all(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let mut page = 1;
        loop {
            let listing = self.cms.list_products(page, PER_PAGE).await?;
            if listing.is_empty() {
                break;
            }
            summary.total += listing.unusable;
            summary.missing_stock += listing.unusable;
            for product in listing.products {
                summary.total += 1;
                let Some(cms_stock) = product.stock else {
                    summary.missing_stock += 1;
                    continue;
                };
                let slug = &product.slug;
                match self.ledger.raise_stock(slug, cms_stock).await? {
                    StockRaise::Initialised => summary.updated += 1,
                    StockRaise::Raised { from } => {
                        tracing::info!(slug = %slug, from, to = cms_stock, "Restocked from CMS");
                        summary.restocked += 1;
                    }
                    StockRaise::Above { current } => {
                        tracing::info!(slug = %slug, cms = cms_stock, ledger = current, "Stock drift detected");
                        summary.drift += 1;
                    }
                    StockRaise::Unchanged => summary.skipped += 1,
                }
            }
            page += 1;
        }

        self.store
            .set(keys::STOCK_LAST_SYNC, &Utc::now().timestamp_millis().to_string(), SetOptions::default())
            .await?;
        Ok(summary)
    }
}
