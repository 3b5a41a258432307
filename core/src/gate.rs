//! Storage contracts for the idempotency and rate-limit gate.
//!
//! The gate wraps `CreateReservation`. Keys are claimed atomically before the
//! operation runs, so at most one real execution happens per key within the
//! TTL. A claim that never completes is released, so a failed first attempt
//! does not poison the key.

use crate::error::GateStoreError;
use std::future::Future;
use std::time::Duration;

/// Result of trying to claim an idempotency key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the key and must run the operation
    Claimed,
    /// An earlier call completed; its serialized response is attached
    Completed(String),
    /// An earlier call holds the key and has not finished yet
    InFlight,
}

/// Persistent record of idempotency keys and their responses.
pub trait ReplayStore: Send + Sync {
    /// Atomically claim `key` for `ttl`, or report what already holds it.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError`] if the backend cannot be reached.
    fn claim(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Claim, GateStoreError>> + Send;

    /// Store the serialized response for a claimed key, keeping it for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError`] if the write fails.
    fn complete(
        &self,
        key: &str,
        response: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), GateStoreError>> + Send;

    /// The serialized response stored for `key`, if a completed record is
    /// still live. Never claims the key.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError`] if the backend cannot be reached or the
    /// record cannot be decoded.
    fn completed(&self, key: &str) -> impl Future<Output = Result<Option<String>, GateStoreError>> + Send;

    /// Drop a claim without storing a response.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError`] if the delete fails.
    fn release(&self, key: &str) -> impl Future<Output = Result<(), GateStoreError>> + Send;
}

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    /// The call may proceed and was counted
    Allowed,
    /// The identity is over its limit
    Limited {
        /// How long until the window frees a slot (upper bound)
        retry_after: Duration,
    },
}

/// Sliding-window rate limiter keyed by caller identity.
pub trait RateLimiter: Send + Sync {
    /// Count one call for `identity` and decide whether it is within
    /// `max_requests` per `window`. Check and record happen atomically.
    ///
    /// # Errors
    ///
    /// Returns [`GateStoreError`] if the backend cannot be reached.
    fn check_and_record(
        &self,
        identity: &str,
        max_requests: u32,
        window: Duration,
    ) -> impl Future<Output = Result<RateDecision, GateStoreError>> + Send;
}
