//! In-process store with the same atomicity as the Redis scripts.
//!
//! Every operation runs under a single mutex, which linearises them the way
//! Redis' single-threaded script execution does. Used by tests and local
//! development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::{parse_counter, AtomicStore, Script, SetOptions};
use crate::{Result, StorefrontError};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Entry>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&Entry> {
        let expired = self
            .values
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn counter(&mut self, key: &str) -> i64 {
        let raw = self.live(key).map(|e| e.value.clone());
        parse_counter(key, raw.as_deref())
    }

    fn put(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), Entry { value: value.to_string(), expires_at: None });
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StorefrontError::StorageError("in-memory store poisoned".into()))
    }
}

fn key_at<'a>(keys: &[&'a str], index: usize, script: Script) -> Result<&'a str> {
    keys.get(index).copied().ok_or_else(|| StorefrontError::StorageError(format!("{script:?}: missing KEYS[{}]", index + 1)))
}

fn first_arg(args: &[i64]) -> i64 {
    args.first().copied().unwrap_or(0)
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.live(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let mut state = self.lock()?;
        if options.if_not_exists && state.live(key).is_some() {
            return Ok(false);
        }
        let expires_at = options.ttl.map(|ttl| Instant::now() + ttl);
        state.values.insert(key.to_string(), Entry { value: value.to_string(), expires_at });
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut state = self.lock()?;
        let current = match state.live(key) {
            None => 0,
            Some(e) => e
                .value
                .parse::<i64>()
                .map_err(|_| StorefrontError::StorageError(format!("value at {key} is not an integer")))?,
        };
        let next = current + delta;
        let expires_at = state.live(key).and_then(|e| e.expires_at);
        state.values.insert(key.to_string(), Entry { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let existed = state.live(key).is_some();
        state.values.remove(key);
        Ok(existed)
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        let value = state.live(key).map(|e| e.value.clone());
        state.values.remove(key);
        Ok(value)
    }

    async fn eval(&self, script: Script, keys: &[&str], args: &[i64]) -> Result<Vec<i64>> {
        let mut state = self.lock()?;
        match script {
            Script::Reserve => {
                let (stock_key, reserve_key) = (key_at(keys, 0, script)?, key_at(keys, 1, script)?);
                let want = first_arg(args);
                let available = state.counter(stock_key) - state.counter(reserve_key);
                if want <= 0 || available <= 0 {
                    return Ok(vec![0]);
                }
                let take = want.min(available);
                let reserve = state.counter(reserve_key) + take;
                state.put(reserve_key, reserve);
                Ok(vec![take])
            }
            Script::FinalizeDeduction => {
                let (stock_key, reserve_key) = (key_at(keys, 0, script)?, key_at(keys, 1, script)?);
                let amount = first_arg(args);
                let remaining = state.counter(stock_key) - amount;
                let (new_stock, shortfall) = if remaining < 0 { (0, -remaining) } else { (remaining, 0) };
                let new_reserve = (state.counter(reserve_key) - amount).max(0);
                state.put(stock_key, new_stock);
                state.put(reserve_key, new_reserve);
                Ok(vec![new_stock, shortfall])
            }
            Script::Release => {
                let reserve_key = key_at(keys, 0, script)?;
                let new_reserve = (state.counter(reserve_key) - first_arg(args)).max(0);
                state.put(reserve_key, new_reserve);
                Ok(vec![new_reserve])
            }
            Script::RaiseStock => {
                let stock_key = key_at(keys, 0, script)?;
                let target = first_arg(args);
                let current = state.live(stock_key).and_then(|e| e.value.trim().parse::<i64>().ok());
                match current {
                    Some(current) if current >= target => Ok(vec![current, 0]),
                    current => {
                        state.put(stock_key, target);
                        Ok(vec![current.unwrap_or(-1), 1])
                    }
                }
            }
        }
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        self.lock()?.sorted_sets.entry(set.to_string()).or_default().insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let state = self.lock()?;
        let Some(members) = state.sorted_sets.get(set) else { return Ok(Vec::new()) };
        let mut hits: Vec<(i64, &String)> = members
            .iter()
            .filter(|(_, score)| (min..=max).contains(*score))
            .map(|(member, score)| (*score, member))
            .collect();
        hits.sort();
        Ok(hits.into_iter().map(|(_, member)| member.clone()).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .sorted_sets
            .get_mut(set)
            .is_some_and(|members| members.remove(member).is_some()))
    }
}
