//! Reservation lifecycle scheduler.
//!
//! Outstanding attempts sit in a sorted set scored by expiry (epoch millis).
//! `reclaim_expired` releases whatever holds an attempt still has once its
//! expiry has passed. It runs opportunistically before new reservations are
//! made and from a periodic sweeper task. Units whose release fails are put
//! back under the attempt's record and stay scheduled for the next sweep.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::metadata::ReservedStock;
use super::outcome::{AttemptOutcome, Claim, OutcomeMarkers};
use super::reservation::{ReservationEngine, ReservationRecord, ReservationRecords};
use crate::domain::events::AttemptId;
use crate::store::{keys, AtomicStore};
use crate::{Result, StorefrontError};

#[derive(Clone)]
pub struct ReclaimScheduler {
    store: Arc<dyn AtomicStore>,
    records: ReservationRecords,
    engine: ReservationEngine,
    outcomes: OutcomeMarkers,
    /// Lifetime of records re-saved by [`ReclaimScheduler::requeue`].
    requeue_ttl: Duration,
}

impl ReclaimScheduler {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        records: ReservationRecords,
        engine: ReservationEngine,
        outcomes: OutcomeMarkers,
        requeue_ttl: Duration,
    ) -> Self {
        Self { store, records, engine, outcomes, requeue_ttl }
    }

    pub async fn schedule(&self, attempt: &AttemptId, expires_at: DateTime<Utc>) -> Result<()> {
        self.store.zadd(keys::RECLAIM_SCHEDULE, expires_at.timestamp_millis(), &attempt.to_string()).await?;
        tracing::debug!(attempt = %attempt, expires_at = %expires_at, "Scheduled reservation reclaim");
        Ok(())
    }

    pub async fn cancel(&self, attempt: &AttemptId) -> Result<()> {
        self.store.zrem(keys::RECLAIM_SCHEDULE, &attempt.to_string()).await?;
        Ok(())
    }

    /// Hands units a settling path took but could not release back to the
    /// attempt: re-saves them as its record, makes it due now and withdraws
    /// the outcome claim so the next sweep or redelivery releases them.
    pub async fn requeue(&self, attempt: &AttemptId, unreleased: &ReservedStock) -> Result<()> {
        let now = Utc::now();
        let record = ReservationRecord::new(attempt, unreleased, now, now);
        self.records.save(attempt, &record, self.requeue_ttl).await?;
        self.schedule(attempt, now).await?;
        self.outcomes.withdraw(attempt).await?;
        tracing::warn!(attempt = %attempt, unreleased = ?unreleased, "Requeued units that could not be released");
        Ok(())
    }

    /// Releases every scheduled attempt with `expires_at <= now` and returns
    /// the ones this call actually reclaimed. Safe to run concurrently: an
    /// attempt already settled by any path is dropped from the schedule
    /// without touching the ledger.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<AttemptId>> {
        let due = self.store.zrange_by_score(keys::RECLAIM_SCHEDULE, 0, now.timestamp_millis()).await?;
        let mut reclaimed = Vec::new();

        for member in due {
            let Some(attempt) = AttemptId::parse(&member) else {
                tracing::warn!(member = %member, "Dropping malformed reclaim schedule entry");
                self.store.zrem(keys::RECLAIM_SCHEDULE, &member).await?;
                continue;
            };
            match self.reclaim_one(&attempt).await {
                Ok(true) => reclaimed.push(attempt),
                Ok(false) => {}
                // Entry stays scheduled for the next sweep.
                Err(e) => tracing::error!(attempt = %attempt, error = %e, "Reclaim failed"),
            }
        }

        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Reclaimed expired reservations");
        }
        Ok(reclaimed)
    }

    async fn reclaim_one(&self, attempt: &AttemptId) -> Result<bool> {
        if let Claim::Lost(outcome) = self.outcomes.claim(attempt, AttemptOutcome::Reclaimed).await? {
            tracing::debug!(attempt = %attempt, outcome = ?outcome, "Attempt already settled, dropping schedule entry");
            self.cancel(attempt).await?;
            return Ok(false);
        }

        let reserved = match self.records.take(attempt).await {
            Ok(reserved) => reserved,
            Err(e) => {
                self.outcomes.withdraw(attempt).await?;
                return Err(e);
            }
        };
        let Some(reserved) = reserved else {
            // Nothing to release here; a late webhook may still settle from attempt metadata.
            self.outcomes.withdraw(attempt).await?;
            self.cancel(attempt).await?;
            return Ok(false);
        };

        let unreleased = self.engine.release(&reserved).await;
        if !unreleased.is_empty() {
            self.requeue(attempt, &unreleased).await?;
            return Err(StorefrontError::StorageError(format!("{} product(s) still held", unreleased.len())));
        }
        self.cancel(attempt).await?;
        tracing::info!(attempt = %attempt, items = reserved.len(), "Reclaimed abandoned reservation");
        Ok(true)
    }

    /// Runs `reclaim_expired` every `period` until the task is aborted.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.reclaim_expired(Utc::now()).await {
                    tracing::warn!(error = %e, "Reclaim sweep failed");
                }
            }
        })
    }
}
