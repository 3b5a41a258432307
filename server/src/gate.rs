//! Idempotency and rate-limit gate in front of the booking coordinator.
//!
//! # Behavior
//!
//! - **First request**: claims the key, runs the operation, stores the JSON
//!   response for the replay TTL
//! - **Retry with same key**: returns the stored response verbatim, the
//!   operation does not run again
//! - **Retry while the first is running**: [`GateError::InProgress`]
//! - **Failed operation**: the claim is released and nothing is stored, so the
//!   next attempt re-executes instead of replaying a failure
//! - **Response not stored**: the operation succeeded but writing its response
//!   failed. The pending claim stays, so retries get [`GateError::InProgress`]
//!   until the in-flight TTL lapses instead of running the operation twice
//!
//! Keys are scoped by client (`idempotency:{client}:{key}`) to prevent
//! cross-client replay. A claim abandoned mid-flight (the caller's future was
//! dropped) expires after the in-flight TTL.

use crate::metrics;
use pantry_core::error::GateStoreError;
use pantry_core::gate::{Claim, RateDecision, RateLimiter, ReplayStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Shortest accepted idempotency key.
pub const MIN_KEY_LEN: usize = 16;
/// Longest accepted idempotency key.
pub const MAX_KEY_LEN: usize = 128;

/// Errors raised by the gate, wrapping the guarded operation's own error.
#[derive(Error, Debug)]
pub enum GateError<E> {
    /// The idempotency key or client id is malformed.
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Another request with the same key has not finished yet.
    #[error("A request with this idempotency key is still in progress")]
    InProgress,

    /// The caller is over its request budget.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Upper bound on the wait before a slot frees up
        retry_after: Duration,
    },

    /// The replay store or rate limiter failed.
    #[error("Gate store error: {0}")]
    Store(#[from] GateStoreError),

    /// The guarded operation failed. Nothing was recorded for its key.
    #[error("{0}")]
    Operation(E),
}

/// Whether a response came from running the operation or from the replay store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome<T> {
    /// The operation ran during this call
    Executed(T),
    /// A stored response from an earlier call with the same key
    Replayed(T),
}

impl<T> GateOutcome<T> {
    /// The response, however it was produced.
    pub fn into_inner(self) -> T {
        match self {
            Self::Executed(value) | Self::Replayed(value) => value,
        }
    }

    /// Whether the response was replayed.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Guarantees at most one execution of an operation per `(client, key)` within a TTL.
pub struct IdempotencyGate<R> {
    store: R,
    in_flight_ttl: Duration,
}

impl<R: ReplayStore> IdempotencyGate<R> {
    /// Create a gate over `store`, with a one-minute in-flight TTL.
    #[must_use]
    pub const fn new(store: R) -> Self {
        Self {
            store,
            in_flight_ttl: Duration::from_secs(60),
        }
    }

    /// Set how long an unfinished claim blocks duplicates before it expires.
    #[must_use]
    pub const fn with_in_flight_ttl(mut self, ttl: Duration) -> Self {
        self.in_flight_ttl = ttl;
        self
    }

    /// Run `op` at most once for `(client, key)` within `ttl`.
    ///
    /// # Errors
    ///
    /// - [`GateError::InvalidKey`] if `key` is not 16 to 128 characters or `client` is empty
    /// - [`GateError::InProgress`] if the same key is still being processed
    /// - [`GateError::Store`] if the replay store fails before the operation runs
    /// - [`GateError::Operation`] if `op` fails
    #[tracing::instrument(skip(self, op))]
    pub async fn execute<T, E, F, Fut>(
        &self,
        client: &str,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<GateOutcome<T>, GateError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let scoped = scoped_key(client, key)?;

        match self.store.claim(&scoped, self.in_flight_ttl.min(ttl)).await? {
            Claim::Completed(json) => {
                let response = serde_json::from_str(&json).map_err(|e| {
                    GateStoreError::Serialization(format!("Failed to decode stored response: {e}"))
                })?;
                metrics::record_idempotency_replay();
                tracing::debug!("Replaying stored response");
                return Ok(GateOutcome::Replayed(response));
            }
            Claim::InFlight => return Err(GateError::InProgress),
            Claim::Claimed => {}
        }

        match op().await {
            Ok(response) => {
                self.record(&scoped, &response, ttl).await;
                Ok(GateOutcome::Executed(response))
            }
            Err(err) => {
                if let Err(release_err) = self.store.release(&scoped).await {
                    tracing::warn!(error = %release_err, "Failed to release idempotency claim");
                }
                Err(GateError::Operation(err))
            }
        }
    }

    /// Look up a completed response for `(client, key)` without claiming it.
    ///
    /// # Errors
    ///
    /// - [`GateError::InvalidKey`] under the same rules as [`Self::execute`]
    /// - [`GateError::Store`] if the replay store fails or the record cannot be decoded
    pub async fn replay<T, E>(&self, client: &str, key: &str) -> Result<Option<T>, GateError<E>>
    where
        T: DeserializeOwned,
    {
        let scoped = scoped_key(client, key)?;
        let Some(json) = self.store.completed(&scoped).await? else {
            return Ok(None);
        };
        let response = serde_json::from_str(&json).map_err(|e| {
            GateStoreError::Serialization(format!("Failed to decode stored response: {e}"))
        })?;
        metrics::record_idempotency_replay();
        tracing::debug!("Replaying stored response");
        Ok(Some(response))
    }

    /// Store a response. The operation already ran, so failures are logged
    /// rather than reported. The pending claim is kept: releasing it would let
    /// a retry run the operation a second time.
    async fn record<T: Serialize>(&self, scoped: &str, response: &T, ttl: Duration) {
        let stored = match serde_json::to_string(response) {
            Ok(json) => self.store.complete(scoped, &json, ttl).await,
            Err(e) => Err(GateStoreError::Serialization(e.to_string())),
        };

        if let Err(e) = stored {
            tracing::error!(
                error = %e,
                in_flight_ttl = ?self.in_flight_ttl.min(ttl),
                "Failed to store idempotent response, retries stay blocked until the claim expires"
            );
        }
    }
}

fn scoped_key<E>(client: &str, key: &str) -> Result<String, GateError<E>> {
    if client.trim().is_empty() {
        return Err(GateError::InvalidKey("client id is required".to_string()));
    }
    let len = key.chars().count();
    if !(MIN_KEY_LEN..=MAX_KEY_LEN).contains(&len) {
        return Err(GateError::InvalidKey(format!(
            "key must be between {MIN_KEY_LEN} and {MAX_KEY_LEN} characters, got {len}"
        )));
    }
    Ok(format!("idempotency:{client}:{key}"))
}

// ============================================================================
// Redis replay store
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum StoredRecord {
    Pending,
    Completed { response: String },
}

fn pending_marker() -> Result<String, GateStoreError> {
    serde_json::to_string(&StoredRecord::Pending)
        .map_err(|e| GateStoreError::Serialization(e.to_string()))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Deletes a key only while it still holds the pending marker.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// `Redis`-backed [`ReplayStore`].
///
/// Claims use `SET NX EX`, so exactly one caller wins a key.
#[derive(Clone)]
pub struct RedisReplayStore {
    conn_manager: ConnectionManager,
}

impl RedisReplayStore {
    /// Connect to `Redis`.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError::Storage`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, GateStoreError> {
        Ok(Self::from_manager(connect(redis_url).await?))
    }

    /// Use an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }
}

impl ReplayStore for RedisReplayStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<Claim, GateStoreError> {
        let mut conn = self.conn_manager.clone();
        let pending = pending_marker()?;

        // A record can expire between SET NX and GET; try again in that case.
        for _ in 0..3 {
            let won: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&pending)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| GateStoreError::Storage(format!("Redis SET NX error: {e}")))?;
            if won.is_some() {
                return Ok(Claim::Claimed);
            }

            let existing: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| GateStoreError::Storage(format!("Redis GET error: {e}")))?;
            if let Some(json) = existing {
                let record: StoredRecord = serde_json::from_str(&json)
                    .map_err(|e| GateStoreError::Serialization(e.to_string()))?;
                return Ok(match record {
                    StoredRecord::Pending => Claim::InFlight,
                    StoredRecord::Completed { response } => Claim::Completed(response),
                });
            }
        }

        Ok(Claim::InFlight)
    }

    async fn complete(&self, key: &str, response: &str, ttl: Duration) -> Result<(), GateStoreError> {
        let mut conn = self.conn_manager.clone();
        let record = serde_json::to_string(&StoredRecord::Completed {
            response: response.to_string(),
        })
        .map_err(|e| GateStoreError::Serialization(e.to_string()))?;

        let _: () = conn
            .set_ex(key, record, ttl_secs(ttl))
            .await
            .map_err(|e| GateStoreError::Storage(format!("Redis SET error: {e}")))?;
        Ok(())
    }

    async fn completed(&self, key: &str) -> Result<Option<String>, GateStoreError> {
        let mut conn = self.conn_manager.clone();
        let existing: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| GateStoreError::Storage(format!("Redis GET error: {e}")))?;
        let Some(json) = existing else {
            return Ok(None);
        };
        let record: StoredRecord =
            serde_json::from_str(&json).map_err(|e| GateStoreError::Serialization(e.to_string()))?;
        Ok(match record {
            StoredRecord::Pending => None,
            StoredRecord::Completed { response } => Some(response),
        })
    }

    async fn release(&self, key: &str) -> Result<(), GateStoreError> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(pending_marker()?)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GateStoreError::Storage(format!("Redis release error: {e}")))?;
        Ok(())
    }
}

// ============================================================================
// Redis rate limiter
// ============================================================================

/// `Redis`-based rate limiter using a sliding window over a sorted set.
///
/// # Algorithm
///
/// 1. Remove entries outside the window (ZREMRANGEBYSCORE)
/// 2. Count remaining entries (ZCARD)
/// 3. Add this attempt (ZADD)
/// 4. Compare the count against the limit; a rejected attempt is removed again
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn_manager: ConnectionManager,
    sequence: Arc<AtomicU64>,
}

impl RedisRateLimiter {
    /// Connect to `Redis`.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError::Storage`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, GateStoreError> {
        Ok(Self::from_manager(connect(redis_url).await?))
    }

    /// Use an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn rate_limit_key(identity: &str) -> String {
        format!("rate_limit:{identity}")
    }

    #[allow(clippy::cast_possible_truncation)] // Safe: timestamps fit in u64 until year 2554
    fn current_timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

impl RateLimiter for RedisRateLimiter {
    async fn check_and_record(
        &self,
        identity: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, GateStoreError> {
        let mut conn = self.conn_manager.clone();
        let rate_key = Self::rate_limit_key(identity);
        let now_ms = Self::current_timestamp_ms();
        #[allow(clippy::cast_possible_truncation)] // Safe: rate limit windows are small durations
        let window_ms = window.as_millis() as u64;
        let window_start = now_ms.saturating_sub(window_ms);
        let member = format!("{now_ms}-{}", self.sequence.fetch_add(1, Ordering::Relaxed));

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // Redis scores fit in isize
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(&rate_key, 0, window_start as isize)
            .ignore()
            .zcard(&rate_key)
            .zadd(&rate_key, &member, now_ms)
            .ignore()
            .expire(&rate_key, ttl_secs(window) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, identity, "Redis pipeline failed during rate limit check");
                GateStoreError::Storage(format!("Failed to check and record rate limit: {e}"))
            })?;

        if count >= u64::from(max_requests) {
            let _: () = conn
                .zrem(&rate_key, &member)
                .await
                .map_err(|e| GateStoreError::Storage(format!("Failed to drop rejected attempt: {e}")))?;

            tracing::warn!(identity, attempts = count + 1, max_requests, window_ms, "Rate limit exceeded");
            return Ok(RateDecision::Limited { retry_after: window });
        }

        tracing::debug!(identity, attempts = count + 1, max_requests, "Rate limit check passed");
        Ok(RateDecision::Allowed)
    }
}

async fn connect(redis_url: &str) -> Result<ConnectionManager, GateStoreError> {
    let client = Client::open(redis_url)
        .map_err(|e| GateStoreError::Storage(format!("Failed to create Redis client: {e}")))?;
    ConnectionManager::new(client).await.map_err(|e| {
        GateStoreError::Storage(format!("Failed to create Redis connection manager: {e}"))
    })
}
