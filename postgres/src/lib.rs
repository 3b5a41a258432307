//! `PostgreSQL` stores for the pantry booking engine.
//!
//! This crate implements the store traits from `pantry-core` on top of sqlx:
//!
//! - [`PostgresLedger`]: the authoritative ledger. One [`PostgresUnitOfWork`]
//!   wraps one database transaction.
//! - [`PostgresCacheStore`]: the read-side document cache.
//!
//! Both stores share one set of migrations. The ledger and the cache may live
//! in separate databases; run [`run_migrations`] against each pool.
//!
//! # Concurrency guarantees
//!
//! - Stock never goes negative: decrements are a single conditional
//!   `UPDATE ... WHERE quantity_on_hand >= $qty`, backed by a `CHECK` constraint.
//! - Overlapping active bookings are rejected by a `btree_gist` exclusion
//!   constraint on `(household_id, location_id, tstzrange(slot_start, slot_end))`.
//!   The constraint violation (SQLSTATE `23P01`) surfaces as
//!   [`LedgerError::ExclusionViolated`](pantry_core::LedgerError::ExclusionViolated).
//!
//! # Example
//!
//! ```ignore
//! use pantry_postgres::{run_migrations, PostgresLedger};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/pantry").await?;
//!     run_migrations(&pool).await?;
//!     let ledger = PostgresLedger::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod ledger;

pub use cache::PostgresCacheStore;
pub use ledger::{PostgresLedger, PostgresUnitOfWork};

use sqlx::PgPool;

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails to apply.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
