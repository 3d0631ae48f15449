//! Inventory: stock ledger, reservations and their lifecycle

pub mod ledger;
pub mod metadata;
pub mod outcome;
pub mod reservation;
pub mod scheduler;

pub use ledger::{Deduction, StockLedger, StockLevels, StockRaise};
pub use metadata::ReservedStock;
pub use outcome::{AttemptOutcome, Claim, OutcomeMarkers};
pub use reservation::{ReservationEngine, ReservationOutcome, ReservationRecord, ReservationRecords};
pub use scheduler::ReclaimScheduler;

use std::sync::Arc;
use std::time::Duration;

use crate::store::AtomicStore;

/// The inventory components wired to one store.
#[derive(Clone)]
pub struct Inventory {
    pub ledger: StockLedger,
    pub engine: ReservationEngine,
    pub records: ReservationRecords,
    pub outcomes: OutcomeMarkers,
    pub scheduler: ReclaimScheduler,
}

impl Inventory {
    /// `outcome_ttl` bounds how long attempt outcome markers and requeued
    /// records are kept.
    pub fn new(store: Arc<dyn AtomicStore>, outcome_ttl: Duration) -> Self {
        let ledger = StockLedger::new(store.clone());
        let engine = ReservationEngine::new(ledger.clone());
        let records = ReservationRecords::new(store.clone());
        let outcomes = OutcomeMarkers::new(store.clone(), outcome_ttl);
        let scheduler = ReclaimScheduler::new(store, records.clone(), engine.clone(), outcomes.clone(), outcome_ttl);
        Self { ledger, engine, records, outcomes, scheduler }
    }
}
