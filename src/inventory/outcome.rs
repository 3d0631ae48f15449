//! Per-attempt outcome markers.
//!
//! Every terminal path for an attempt (commit, release, reclaim) claims the
//! marker with set-if-absent before it touches the ledger. Exactly one path
//! wins; the others leave stock alone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::events::AttemptId;
use crate::store::{keys, AtomicStore, SetOptions};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Committed,
    Released,
    Reclaimed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Reclaimed => "reclaimed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            "reclaimed" => Some(Self::Reclaimed),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Won,
    /// Another path already settled the attempt. `None` if the marker vanished in between.
    Lost(Option<AttemptOutcome>),
}

#[derive(Clone)]
pub struct OutcomeMarkers {
    store: Arc<dyn AtomicStore>,
    ttl: Duration,
}

impl OutcomeMarkers {
    pub fn new(store: Arc<dyn AtomicStore>, ttl: Duration) -> Self { Self { store, ttl } }

    pub async fn claim(&self, attempt: &AttemptId, outcome: AttemptOutcome) -> Result<Claim> {
        let key = keys::attempt_outcome(attempt);
        if self.store.set(&key, outcome.as_str(), SetOptions::nx().with_ttl(self.ttl)).await? {
            return Ok(Claim::Won);
        }
        let existing = self.store.get(&key).await?;
        Ok(Claim::Lost(existing.as_deref().and_then(AttemptOutcome::parse)))
    }

    pub async fn get(&self, attempt: &AttemptId) -> Result<Option<AttemptOutcome>> {
        let raw = self.store.get(&keys::attempt_outcome(attempt)).await?;
        Ok(raw.as_deref().and_then(AttemptOutcome::parse))
    }

    /// Gives a claim back so a later path can settle the attempt.
    pub async fn withdraw(&self, attempt: &AttemptId) -> Result<()> {
        self.store.del(&keys::attempt_outcome(attempt)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_single_winner() {
        let markers = OutcomeMarkers::new(Arc::new(InMemoryStore::new()), Duration::from_secs(60));
        let attempt = AttemptId::PaymentIntent("pi_1".into());

        assert_eq!(markers.claim(&attempt, AttemptOutcome::Committed).await.unwrap(), Claim::Won);
        assert_eq!(
            markers.claim(&attempt, AttemptOutcome::Released).await.unwrap(),
            Claim::Lost(Some(AttemptOutcome::Committed))
        );

        markers.withdraw(&attempt).await.unwrap();
        assert_eq!(markers.get(&attempt).await.unwrap(), None);
        assert_eq!(markers.claim(&attempt, AttemptOutcome::Reclaimed).await.unwrap(), Claim::Won);
    }
}
