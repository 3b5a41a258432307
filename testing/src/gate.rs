//! In-memory idempotency replay store and rate limiter.
//!
//! Both take their notion of time from a [`Clock`] so tests can move past a
//! TTL or a rate-limit window without sleeping.

use crate::lock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pantry_core::environment::{Clock, SystemClock};
use pantry_core::error::GateStoreError;
use pantry_core::gate::{Claim, RateDecision, RateLimiter, ReplayStore};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Record {
    Pending,
    Completed(String),
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// HashMap-backed [`ReplayStore`].
#[derive(Clone)]
pub struct InMemoryReplayStore {
    records: Arc<Mutex<HashMap<String, (Record, DateTime<Utc>)>>>,
    fail_next_complete: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReplayStore {
    /// Create a store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires records according to `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            fail_next_complete: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Make the next `complete` fail with a storage error.
    pub fn fail_next_complete(&self) {
        self.fail_next_complete.store(true, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        lock(&self.records)
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    /// Whether no live records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayStore for InMemoryReplayStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<Claim, GateStoreError> {
        let now = self.clock.now();
        let mut records = lock(&self.records);

        if let Some((record, expires_at)) = records.get(key) {
            if *expires_at > now {
                return Ok(match record {
                    Record::Pending => Claim::InFlight,
                    Record::Completed(response) => Claim::Completed(response.clone()),
                });
            }
        }

        records.insert(key.to_string(), (Record::Pending, now + to_chrono(ttl)));
        Ok(Claim::Claimed)
    }

    async fn complete(&self, key: &str, response: &str, ttl: Duration) -> Result<(), GateStoreError> {
        if self.fail_next_complete.swap(false, Ordering::SeqCst) {
            return Err(GateStoreError::Storage("connection reset".to_string()));
        }
        let now = self.clock.now();
        lock(&self.records).insert(
            key.to_string(),
            (Record::Completed(response.to_string()), now + to_chrono(ttl)),
        );
        Ok(())
    }

    async fn completed(&self, key: &str) -> Result<Option<String>, GateStoreError> {
        let now = self.clock.now();
        Ok(match lock(&self.records).get(key) {
            Some((Record::Completed(response), expires_at)) if *expires_at > now => Some(response.clone()),
            _ => None,
        })
    }

    async fn release(&self, key: &str) -> Result<(), GateStoreError> {
        let mut records = lock(&self.records);
        if matches!(records.get(key), Some((Record::Pending, _))) {
            records.remove(key);
        }
        Ok(())
    }
}

/// Sliding-window [`RateLimiter`] keeping one timestamp queue per identity.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimiter {
    /// Create a limiter using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a limiter driven by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_record(
        &self,
        identity: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, GateStoreError> {
        let now = self.clock.now();
        let window_start = now - to_chrono(window);
        let mut windows = lock(&self.windows);
        let hits = windows.entry(identity.to_string()).or_default();

        while hits.front().is_some_and(|t| *t <= window_start) {
            hits.pop_front();
        }

        if hits.len() >= max_requests as usize {
            let retry_after = hits
                .front()
                .and_then(|oldest| (*oldest - window_start).to_std().ok())
                .unwrap_or(window);
            return Ok(RateDecision::Limited { retry_after });
        }

        hits.push_back(now);
        Ok(RateDecision::Allowed)
    }
}
