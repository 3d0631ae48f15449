//! Shared atomic key-value store.
//!
//! All coordination state (stock counters, reservation records, idempotency
//! markers, the reclaim schedule) lives here; request handlers keep nothing
//! in process. Compound check-and-mutate steps are server-evaluated scripts,
//! never a client-side read followed by a write.
//!
//! ## Key Patterns
//!
//! ```text
//! stock:product:{slug}              → ready-to-ship units
//! reserve:product:{slug}            → units held by unsettled attempts
//! reserve:session:{id}              → reservation record (JSON)
//! reserve:payment_intent:{id}       → reservation record (JSON)
//! processed:event:{event_id}        → webhook event already handled
//! processed:{kind}:{attempt_id}     → attempt outcome (committed / released / reclaimed)
//! reserve:cleanup:schedule          → sorted set, member `{kind}:{id}`, score = expiry ms
//! stock_sync_lock                   → admin sync mutex
//! stock_last_sync_ts                → last admin sync (ms)
//! ```

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::{Result, StorefrontError};

/// Options for [`AtomicStore::set`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub if_not_exists: bool,
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn nx() -> Self { Self { if_not_exists: true, ttl: None } }
    pub fn with_ttl(mut self, ttl: Duration) -> Self { self.ttl = Some(ttl); self }
}

/// Server-evaluated atomic scripts. Each returns an array of integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Script {
    /// KEYS: stock, reserve. ARGV: want. Returns `[take]`.
    Reserve,
    /// KEYS: stock, reserve. ARGV: amount. Returns `[new_stock, shortfall]`.
    FinalizeDeduction,
    /// KEYS: reserve. ARGV: amount. Returns `[new_reserve]`.
    Release,
    /// KEYS: stock. ARGV: target. Writes `target` only when `stock` is
    /// absent or lower. Returns `[previous, raised]`, `previous = -1` when absent.
    RaiseStock,
}

impl Script {
    pub fn lua(&self) -> &'static str {
        match self {
            Self::Reserve => RESERVE_LUA,
            Self::FinalizeDeduction => FINALIZE_DEDUCTION_LUA,
            Self::Release => RELEASE_LUA,
            Self::RaiseStock => RAISE_STOCK_LUA,
        }
    }
}

const RESERVE_LUA: &str = r#"
local stock = tonumber(redis.call("GET", KEYS[1]) or "0") or 0
local reserve = tonumber(redis.call("GET", KEYS[2]) or "0") or 0
local want = tonumber(ARGV[1]) or 0
if want <= 0 then return {0} end
local available = stock - reserve
if available <= 0 then return {0} end
local take = want
if take > available then take = available end
redis.call("INCRBY", KEYS[2], take)
return {take}
"#;

const FINALIZE_DEDUCTION_LUA: &str = r#"
local stock = tonumber(redis.call("GET", KEYS[1]) or "0") or 0
local reserve = tonumber(redis.call("GET", KEYS[2]) or "0") or 0
local amount = tonumber(ARGV[1]) or 0
local newStock = stock - amount
local shortfall = 0
if newStock < 0 then
  shortfall = -newStock
  newStock = 0
end
local newReserve = reserve - amount
if newReserve < 0 then newReserve = 0 end
redis.call("SET", KEYS[1], newStock)
redis.call("SET", KEYS[2], newReserve)
return {newStock, shortfall}
"#;

const RELEASE_LUA: &str = r#"
local reserve = tonumber(redis.call("GET", KEYS[1]) or "0") or 0
local amount = tonumber(ARGV[1]) or 0
local newReserve = reserve - amount
if newReserve < 0 then newReserve = 0 end
redis.call("SET", KEYS[1], newReserve)
return {newReserve}
"#;

const RAISE_STOCK_LUA: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1]) or "")
local target = tonumber(ARGV[1]) or 0
if not current then
  redis.call("SET", KEYS[1], target)
  return {-1, 1}
end
if target > current then
  redis.call("SET", KEYS[1], target)
  return {current, 1}
end
return {current, 0}
"#;

/// Atomic primitives of the shared store.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns `false` when `if_not_exists` was requested and the key already existed.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically reads and deletes a key. At most one concurrent caller sees the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    async fn eval(&self, script: Script, keys: &[&str], args: &[i64]) -> Result<Vec<i64>>;

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>>;

    /// Returns whether the member was present.
    async fn zrem(&self, set: &str, member: &str) -> Result<bool>;
}

pub mod keys {
    use crate::domain::events::AttemptId;
    use crate::domain::value_objects::Slug;

    pub const RECLAIM_SCHEDULE: &str = "reserve:cleanup:schedule";
    pub const STOCK_SYNC_LOCK: &str = "stock_sync_lock";
    pub const STOCK_LAST_SYNC: &str = "stock_last_sync_ts";

    pub fn stock(slug: &Slug) -> String { format!("stock:product:{slug}") }
    pub fn reserve(slug: &Slug) -> String { format!("reserve:product:{slug}") }
    pub fn reservation(attempt: &AttemptId) -> String { format!("reserve:{}:{}", attempt.kind(), attempt.id()) }
    pub fn processed_event(event_id: &str) -> String { format!("processed:event:{event_id}") }
    pub fn attempt_outcome(attempt: &AttemptId) -> String { format!("processed:{}:{}", attempt.kind(), attempt.id()) }
}

/// Parses a stored counter. Garbage counts as zero.
pub(crate) fn parse_counter(key: &str, raw: Option<&str>) -> i64 {
    match raw {
        None => 0,
        Some(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, "Non-numeric counter treated as 0");
            0
        }),
    }
}

/// Bounded exponential backoff for store calls that must not be dropped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new() -> Self {
        Self { max_attempts: 3, initial_delay: Duration::from_millis(100), max_delay: Duration::from_secs(2) }
    }
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self { self.max_attempts = attempts; self }
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self { self.initial_delay = delay; self }

    /// `initial * 2^attempt`, capped, with 50–100% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// Runs `op`, retrying storage errors only.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(StorefrontError::StorageError(message)) if attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(operation = %what, attempt = attempt + 1, error = %message, ?delay, "Store call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::new() }
}
