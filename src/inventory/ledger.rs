//! Stock ledger: the only legal mutations of the per-product counters.

use serde::Serialize;
use std::sync::Arc;

use crate::domain::value_objects::Slug;
use crate::store::{keys, parse_counter, AtomicStore, Script, SetOptions};
use crate::{Result, StorefrontError};

/// Snapshot of one product's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StockLevels {
    pub stock: i64,
    pub reserve: i64,
}

impl StockLevels {
    /// Available-to-promise, never negative.
    pub fn available(&self) -> i64 { (self.stock - self.reserve).max(0) }
}

/// Result of a final deduction at settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deduction {
    Applied { stock: i64 },
    /// Stock could not cover the amount and was clamped at zero.
    /// `shortfall == amount` means stock was already depleted.
    Drift { stock: i64, shortfall: i64 },
}

/// Result of raising `stock` towards a CMS value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockRaise {
    /// No usable value was stored; `stock` now holds the target.
    Initialised,
    Raised { from: i64 },
    Unchanged,
    /// The ledger is above the target and was left alone.
    Above { current: i64 },
}

impl Deduction {
    pub fn stock(&self) -> i64 {
        match self { Self::Applied { stock } | Self::Drift { stock, .. } => *stock }
    }
}

#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn AtomicStore>,
}

impl StockLedger {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self { Self { store } }

    pub async fn levels(&self, slug: &Slug) -> Result<StockLevels> {
        let (stock_key, reserve_key) = (keys::stock(slug), keys::reserve(slug));
        let stock = self.store.get(&stock_key).await?;
        let reserve = self.store.get(&reserve_key).await?;
        Ok(StockLevels {
            stock: parse_counter(&stock_key, stock.as_deref()),
            reserve: parse_counter(&reserve_key, reserve.as_deref()),
        })
    }

    /// `max(0, stock - reserve)`.
    pub async fn get_available(&self, slug: &Slug) -> Result<i64> {
        Ok(self.levels(slug).await?.available())
    }

    /// First-touch initialisation from the CMS mirror; an existing value wins.
    pub async fn seed(&self, slug: &Slug, quantity: i64) -> Result<bool> {
        let seeded = self.store.set(&keys::stock(slug), &quantity.max(0).to_string(), SetOptions::nx()).await?;
        if seeded {
            tracing::debug!(slug = %slug, stock = quantity, "Seeded stock");
        }
        Ok(seeded)
    }

    /// Raises `stock` to `target` if it is lower or unset, in one atomic step.
    /// A deduction racing with this call is never overwritten.
    pub async fn raise_stock(&self, slug: &Slug, target: i64) -> Result<StockRaise> {
        let target = target.max(0);
        let reply = self.store.eval(Script::RaiseStock, &[&keys::stock(slug)], &[target]).await?;
        let previous = first(&reply, Script::RaiseStock)?;
        let raised = reply.get(1).copied().unwrap_or(0) == 1;
        Ok(match (previous, raised) {
            (-1, true) => StockRaise::Initialised,
            (from, true) => StockRaise::Raised { from },
            (current, false) if current > target => StockRaise::Above { current },
            _ => StockRaise::Unchanged,
        })
    }

    /// Holds up to `want` units against available stock in one atomic step.
    /// Returns the units actually held.
    pub async fn reserve(&self, slug: &Slug, want: u32) -> Result<u32> {
        let (stock_key, reserve_key) = (keys::stock(slug), keys::reserve(slug));
        let reply = self.store.eval(Script::Reserve, &[&stock_key, &reserve_key], &[i64::from(want)]).await?;
        let take = first(&reply, Script::Reserve)?;
        u32::try_from(take.clamp(0, i64::from(want)))
            .map_err(|_| StorefrontError::StorageError(format!("reserve script returned {take}")))
    }

    /// Permanently removes `amount` from `stock` and releases the same hold,
    /// in one atomic step. Stock is clamped at zero.
    pub async fn finalize_deduction(&self, slug: &Slug, amount: u32) -> Result<Deduction> {
        let (stock_key, reserve_key) = (keys::stock(slug), keys::reserve(slug));
        let reply = self
            .store
            .eval(Script::FinalizeDeduction, &[&stock_key, &reserve_key], &[i64::from(amount)])
            .await?;
        let stock = first(&reply, Script::FinalizeDeduction)?;
        let shortfall = reply.get(1).copied().unwrap_or(0);
        if shortfall > 0 {
            tracing::warn!(slug = %slug, amount, shortfall, stock, "Inventory drift: deduction exceeded stock");
            return Ok(Deduction::Drift { stock, shortfall });
        }
        Ok(Deduction::Applied { stock })
    }

    /// Returns `amount` held units to the pool without touching `stock`.
    pub async fn release_reservation(&self, slug: &Slug, amount: u32) -> Result<i64> {
        let reserve_key = keys::reserve(slug);
        let reply = self.store.eval(Script::Release, &[&reserve_key], &[i64::from(amount)]).await?;
        first(&reply, Script::Release)
    }
}

fn first(reply: &[i64], script: Script) -> Result<i64> {
    reply
        .first()
        .copied()
        .ok_or_else(|| StorefrontError::StorageError(format!("{script:?} returned an empty reply")))
}
