//! # Pantry Server
//!
//! Orchestration for the pantry booking engine:
//!
//! - [`coordinator`]: turns a reservation request into one atomic unit of work
//! - [`sync`]: projects committed ledger rows into the TTL-stamped read cache
//! - [`gate`]: idempotency replay and rate limiting around reservation creation
//! - [`service`]: the entry points, composed in request order
//! - [`scheduler`]: timer-driven bulk inventory refresh
//! - [`app`]: production wiring over `PostgreSQL` and `Redis`
//!
//! ## Example
//!
//! ```ignore
//! use pantry_server::{Config, PantryApp};
//!
//! let mut app = PantryApp::new(Config::from_env()).await?;
//! app.start();
//! let summary = app
//!     .service()
//!     .create_reservation(request, Some("2f1c0a9e-6b1d-4c55-9d7a-0e3b8f1f2a44"))
//!     .await?
//!     .into_inner();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod sync;

pub use app::{AppError, PantryApp};
pub use config::Config;
pub use coordinator::{BookingCoordinator, BookingSummary, CreateBooking, LineSummary, RequestedItem};
pub use error::{BookingError, ErrorKind};
pub use gate::{GateError, GateOutcome, IdempotencyGate};
pub use service::{BookingService, ServiceSettings};
pub use sync::{BulkRefresh, CacheSynchronizer, RefreshOptions, RefreshReport, SyncError};
