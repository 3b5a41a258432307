//! # Pantry Core
//!
//! Domain types and store contracts for the pantry booking engine.
//!
//! Households reserve perishable food at a pickup location for a time window.
//! The engine turns each reservation into concrete lot allocations, soonest
//! expiry first, and mirrors committed state into a TTL-stamped read cache.
//!
//! ## Modules
//!
//! - [`types`]: identifiers, lots, bookings, allocations (validated on construction)
//! - [`fefo`]: pure First-Expired-First-Out allocation planning
//! - [`ledger`]: the authoritative store and its atomic unit of work
//! - [`cache`]: read-side documents, staleness metadata and the cache store
//! - [`gate`]: idempotency replay and rate-limit storage contracts
//! - [`error`]: store-level error kinds
//!
//! ## Flow
//!
//! ```text
//! request ─► gate ─► coordinator ─► ledger unit of work ─► commit
//!                         │              (exclusion, FEFO,
//!                         │               atomic decrement)
//!                         ▼
//!                 cache synchronizer ─► cache store
//! ```
//!
//! Implementations live in `pantry-postgres` (production) and `pantry-testing`
//! (in-memory); orchestration lives in `pantry-server`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod fefo;
pub mod gate;
pub mod ledger;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, NaiveDate, Utc};
pub use error::{CacheError, GateStoreError, LedgerError};

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// let clock = FixedClock::new(Utc::now());
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
