//! Read-side cache documents and the store they live in.
//!
//! Cache documents are denormalized copies of committed ledger rows. They are
//! never the source of truth and can be dropped and rebuilt at any time.
//! Every document carries staleness metadata:
//!
//! ```text
//! as_of ──────── ttl ────────► valid_until ──────── ttl ────────► (expired)
//!        fresh                               stale
//! ```
//!
//! Documents are keyed by stable composite keys derived from ledger ids, so
//! repeated refreshes overwrite instead of duplicating.

use crate::error::CacheError;
use crate::types::{
    BookingHistory, BookingId, BookingStatus, FoodItemId, HistoryLine, InventoryRow, LocationId,
    LotId, UserId,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Staleness of a cache document relative to "now".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Within its TTL
    Fresh,
    /// Past its TTL but within one more TTL of grace
    Stale,
    /// Older than that
    Expired,
}

impl CacheStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, CacheError> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "stale" => Ok(Self::Stale),
            "expired" => Ok(Self::Expired),
            other => Err(CacheError::Serialization(format!("invalid cache status: {other}"))),
        }
    }

    /// Evaluate the status of a document stamped with `stamp` at time `now`.
    ///
    /// A grace period that cannot be represented never ends, so such a
    /// document stays stale rather than expiring.
    #[must_use]
    pub fn evaluate(stamp: &CacheStamp, now: DateTime<Utc>) -> Self {
        if now < stamp.cache_valid_until {
            return Self::Fresh;
        }
        let grace_end = TimeDelta::try_seconds(stamp.cache_ttl_sec.max(0))
            .and_then(|ttl| stamp.cache_valid_until.checked_add_signed(ttl));
        match grace_end {
            Some(end) if now >= end => Self::Expired,
            _ => Self::Stale,
        }
    }
}

/// Staleness metadata shared by every cache document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStamp {
    /// When the authoritative rows were read
    pub as_of: DateTime<Utc>,
    /// Time to live in seconds
    pub cache_ttl_sec: i64,
    /// `as_of + cache_ttl_sec`
    pub cache_valid_until: DateTime<Utc>,
    /// Status at the time the document was last written or read
    pub cache_status: CacheStatus,
}

impl CacheStamp {
    /// Stamp a document read at `as_of`, fresh for `ttl_sec` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTtl`] if `ttl_sec` is not positive, or if
    /// the fresh period and its equal grace period do not fit in a timestamp.
    pub fn fresh(as_of: DateTime<Utc>, ttl_sec: i64) -> Result<Self, CacheError> {
        if ttl_sec <= 0 {
            return Err(CacheError::InvalidTtl(ttl_sec));
        }
        let ttl = TimeDelta::try_seconds(ttl_sec).ok_or(CacheError::InvalidTtl(ttl_sec))?;
        let cache_valid_until = as_of
            .checked_add_signed(ttl)
            .filter(|until| until.checked_add_signed(ttl).is_some())
            .ok_or(CacheError::InvalidTtl(ttl_sec))?;
        Ok(Self {
            as_of,
            cache_ttl_sec: ttl_sec,
            cache_valid_until,
            cache_status: CacheStatus::Fresh,
        })
    }

    /// Re-evaluate `cache_status` against `now`.
    #[must_use]
    pub fn at(self, now: DateTime<Utc>) -> Self {
        Self {
            cache_status: CacheStatus::evaluate(&self, now),
            ..self
        }
    }
}

// ============================================================================
// Inventory documents
// ============================================================================

/// Cached view of one lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDocument {
    /// Stable key: `lot:{lot_id}`
    pub key: String,
    /// Lot ID
    pub lot_id: LotId,
    /// Item ID
    pub food_item_id: FoodItemId,
    /// Item name
    pub item_name: String,
    /// Category name
    pub category: String,
    /// Unit of measure
    pub unit: String,
    /// Units on hand when read
    pub qty_on_hand: i32,
    /// Location ID
    pub location_id: LocationId,
    /// Location name
    pub location_name: String,
    /// Expiry date
    pub expiry_date: NaiveDate,
    /// Diet tags
    pub diets: Vec<String>,
    /// Staleness metadata
    #[serde(flatten)]
    pub stamp: CacheStamp,
}

impl InventoryDocument {
    /// Cache key of a lot.
    #[must_use]
    pub fn key_for(lot_id: LotId) -> String {
        format!("lot:{lot_id}")
    }

    /// Project a ledger row into a document.
    #[must_use]
    pub fn from_row(row: InventoryRow, stamp: CacheStamp) -> Self {
        Self {
            key: Self::key_for(row.lot_id),
            lot_id: row.lot_id,
            food_item_id: row.food_item_id,
            item_name: row.item_name,
            category: row.category,
            unit: row.unit,
            qty_on_hand: row.qty_on_hand,
            location_id: row.location_id,
            location_name: row.location_name,
            expiry_date: row.expiry_date,
            diets: row.diets,
            stamp,
        }
    }

    /// Whether the business fields of two documents match, ignoring staleness metadata.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.key == other.key
            && self.lot_id == other.lot_id
            && self.food_item_id == other.food_item_id
            && self.item_name == other.item_name
            && self.category == other.category
            && self.unit == other.unit
            && self.qty_on_hand == other.qty_on_hand
            && self.location_id == other.location_id
            && self.location_name == other.location_name
            && self.expiry_date == other.expiry_date
            && self.diets == other.diets
    }
}

/// Filters applied to cached inventory documents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFilter {
    /// Case-insensitive substring over item name and category
    pub search: Option<String>,
    /// Diet tag the item must carry (case-insensitive)
    pub diet: Option<String>,
    /// Only documents with stock on hand
    #[serde(default)]
    pub in_stock_only: bool,
    /// Exact category (case-insensitive)
    pub category: Option<String>,
}

impl InventoryFilter {
    /// Whether `doc` passes every set filter.
    #[must_use]
    pub fn matches(&self, doc: &InventoryDocument) -> bool {
        if self.in_stock_only && doc.qty_on_hand <= 0 {
            return false;
        }
        if let Some(search) = non_blank(self.search.as_deref()) {
            let needle = search.to_lowercase();
            if !doc.item_name.to_lowercase().contains(&needle)
                && !doc.category.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if let Some(diet) = non_blank(self.diet.as_deref()) {
            if !doc.diets.iter().any(|d| d.eq_ignore_ascii_case(diet)) {
                return false;
            }
        }
        if let Some(category) = non_blank(self.category.as_deref()) {
            if !doc.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        true
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// History documents
// ============================================================================

/// Cached view of one booking for one subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDocument {
    /// Subject key: `user:{user_id}`
    pub subject_key: String,
    /// Booking ID
    pub booking_id: BookingId,
    /// Location name
    pub location: String,
    /// Window start
    pub slot_start: DateTime<Utc>,
    /// Window end
    pub slot_end: DateTime<Utc>,
    /// Booking status
    pub status: BookingStatus,
    /// Line items
    pub items: Vec<HistoryLine>,
    /// Staleness metadata
    #[serde(flatten)]
    pub stamp: CacheStamp,
}

impl HistoryDocument {
    /// Subject key of a user.
    #[must_use]
    pub fn subject_key_for(user_id: UserId) -> String {
        format!("user:{user_id}")
    }

    /// Project a ledger booking into a document for `user_id`.
    #[must_use]
    pub fn from_history(user_id: UserId, history: BookingHistory, stamp: CacheStamp) -> Self {
        Self {
            subject_key: Self::subject_key_for(user_id),
            booking_id: history.booking_id,
            location: history.location_name,
            slot_start: history.slot.start(),
            slot_end: history.slot.end(),
            status: history.status,
            items: history.items,
            stamp,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// What an upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No document existed under the key
    Inserted,
    /// A document existed and its business fields changed
    Updated,
    /// Only staleness metadata changed
    Unchanged,
}

/// Read-side document store. Exclusively written by the cache synchronizer.
pub trait CacheStore: Send + Sync {
    /// Insert or replace the inventory document under `doc.key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the write fails.
    fn upsert_inventory(
        &self,
        doc: &InventoryDocument,
    ) -> impl Future<Output = Result<UpsertOutcome, CacheError>> + Send;

    /// Keys of every cached inventory document.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the read fails.
    fn inventory_keys(&self) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;

    /// Remove inventory documents by key, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the delete fails.
    fn remove_inventory(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<u64, CacheError>> + Send;

    /// Every cached inventory document, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the read fails.
    fn load_inventory(
        &self,
    ) -> impl Future<Output = Result<Vec<InventoryDocument>, CacheError>> + Send;

    /// Insert or replace the history document under `(doc.subject_key, doc.booking_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the write fails.
    fn upsert_history(
        &self,
        doc: &HistoryDocument,
    ) -> impl Future<Output = Result<UpsertOutcome, CacheError>> + Send;

    /// Remove a subject's history documents for bookings not in `keep`,
    /// returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the delete fails.
    fn retain_history(
        &self,
        subject_key: &str,
        keep: &[BookingId],
    ) -> impl Future<Output = Result<u64, CacheError>> + Send;

    /// A subject's cached history documents, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the read fails.
    fn load_history(
        &self,
        subject_key: &str,
    ) -> impl Future<Output = Result<Vec<HistoryDocument>, CacheError>> + Send;
}
