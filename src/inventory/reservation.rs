//! Reservation engine and reservation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::ledger::StockLedger;
use super::metadata::{self, ReservedStock};
use crate::domain::events::AttemptId;
use crate::domain::value_objects::Slug;
use crate::store::{keys, AtomicStore, RetryPolicy, SetOptions};
use crate::Result;

/// Split of one request into units held against stock and units to be made to order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservationOutcome {
    /// Only products with at least one unit held.
    pub reserved: ReservedStock,
    /// Only products with a positive remainder.
    pub backorder: BTreeMap<Slug, u32>,
}

impl ReservationOutcome {
    pub fn has_backorder(&self) -> bool { !self.backorder.is_empty() }
    pub fn has_reserved(&self) -> bool { !self.reserved.is_empty() }
}

#[derive(Clone)]
pub struct ReservationEngine {
    ledger: StockLedger,
    retry: RetryPolicy,
}

impl ReservationEngine {
    pub fn new(ledger: StockLedger) -> Self { Self { ledger, retry: RetryPolicy::default() } }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }

    pub fn ledger(&self) -> &StockLedger { &self.ledger }

    /// Reserves each item independently; a stock-out on one product never blocks another.
    ///
    /// If the store fails part-way, units already held for this request are
    /// released before the error is returned.
    pub async fn reserve(&self, items: &[(Slug, u32)]) -> Result<ReservationOutcome> {
        let mut outcome = ReservationOutcome::default();
        for (slug, quantity) in items {
            let take = match self.ledger.reserve(slug, *quantity).await {
                Ok(take) => take,
                Err(e) => {
                    tracing::error!(slug = %slug, error = %e, "Reservation failed, rolling back");
                    let stuck = self.release(&outcome.reserved).await;
                    if !stuck.is_empty() {
                        tracing::error!(unreleased = ?stuck, "Rollback incomplete, needs reconciliation");
                    }
                    return Err(e);
                }
            };
            if take > 0 {
                outcome.reserved.insert(slug.clone(), take);
            }
            if *quantity > take {
                outcome.backorder.insert(slug.clone(), quantity - take);
            }
            tracing::debug!(slug = %slug, requested = quantity, reserved = take, "Reserved stock");
        }
        Ok(outcome)
    }

    /// Returns held units to the pool, retrying transient store errors.
    /// A failure on one product does not stop the rest; whatever could not
    /// be released is returned, empty when everything went back.
    pub async fn release(&self, reserved: &ReservedStock) -> ReservedStock {
        let mut unreleased = ReservedStock::new();
        for (slug, amount) in reserved.iter().filter(|(_, amount)| **amount > 0) {
            let released = self.retry.run("release_reservation", || self.ledger.release_reservation(slug, *amount)).await;
            if let Err(e) = released {
                tracing::error!(slug = %slug, amount, error = %e, "Failed to release reservation");
                unreleased.insert(slug.clone(), *amount);
            }
        }
        unreleased
    }
}

/// Store-side record of what one attempt holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRecord {
    pub attempt_id: String,
    pub reserved_in_stock_by_slug: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ReservationRecord {
    pub fn new(attempt: &AttemptId, reserved: &ReservedStock, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            attempt_id: attempt.id().to_string(),
            reserved_in_stock_by_slug: reserved.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            created_at,
            expires_at,
        }
    }
}

/// Persistence of reservation records, keyed by attempt.
#[derive(Clone)]
pub struct ReservationRecords {
    store: Arc<dyn AtomicStore>,
}

impl ReservationRecords {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self { Self { store } }

    pub async fn save(&self, attempt: &AttemptId, record: &ReservationRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.store.set(&keys::reservation(attempt), &json, SetOptions::default().with_ttl(ttl)).await?;
        Ok(())
    }

    /// Reads and deletes the record in one step. `None` means another path got there first
    /// or the record never existed.
    pub async fn take(&self, attempt: &AttemptId) -> Result<Option<ReservedStock>> {
        let raw = self.store.take(&keys::reservation(attempt)).await?;
        Ok(raw.map(|raw| metadata::parse_reserved(Some(&raw))))
    }
}
