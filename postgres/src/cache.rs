//! `PostgreSQL`-backed read-side cache.
//!
//! Inventory documents live in `inventory_cache`, one row per lot key.
//! History documents live in `history_cache`, keyed by `(subject_key, booking_id)`
//! with line items stored as JSONB.
//!
//! Upserts report whether business fields changed: an `UPDATE` that only
//! touches staleness metadata runs first and succeeds only when every
//! business column already matches, otherwise a regular
//! `INSERT ... ON CONFLICT DO UPDATE` writes the row.

use chrono::{DateTime, NaiveDate, Utc};
use pantry_core::cache::{
    CacheStamp, CacheStatus, CacheStore, HistoryDocument, InventoryDocument, UpsertOutcome,
};
use pantry_core::error::CacheError;
use pantry_core::types::{BookingId, BookingStatus, FoodItemId, HistoryLine, LocationId, LotId};
use sqlx::PgPool;

/// `PostgreSQL` cache document store.
#[derive(Clone, Debug)]
pub struct PostgresCacheStore {
    pool: PgPool,
}

impl PostgresCacheStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage(context: &str) -> impl FnOnce(sqlx::Error) -> CacheError + '_ {
    move |e| CacheError::Storage(format!("{context}: {e}"))
}

fn outcome(inserted: bool) -> UpsertOutcome {
    if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    }
}

fn stamp(
    as_of: DateTime<Utc>,
    cache_ttl_sec: i64,
    cache_valid_until: DateTime<Utc>,
    status: &str,
) -> Result<CacheStamp, CacheError> {
    Ok(CacheStamp {
        as_of,
        cache_ttl_sec,
        cache_valid_until,
        cache_status: CacheStatus::parse(status)?,
    })
}

type InventoryCacheRow = (
    String,
    i64,
    i64,
    String,
    String,
    String,
    i32,
    i64,
    String,
    NaiveDate,
    Vec<String>,
    DateTime<Utc>,
    i64,
    DateTime<Utc>,
    String,
);

type HistoryCacheRow = (
    String,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    String,
    serde_json::Value,
    DateTime<Utc>,
    i64,
    DateTime<Utc>,
    String,
);

impl CacheStore for PostgresCacheStore {
    async fn upsert_inventory(&self, doc: &InventoryDocument) -> Result<UpsertOutcome, CacheError> {
        let touched = sqlx::query(
            "UPDATE inventory_cache
             SET as_of = $12, cache_ttl_sec = $13, cache_valid_until = $14, cache_status = $15
             WHERE key = $1
               AND lot_id = $2 AND food_item_id = $3 AND item_name = $4 AND category = $5
               AND unit = $6 AND qty_on_hand = $7 AND location_id = $8 AND location_name = $9
               AND expiry_date = $10 AND diets = $11",
        )
        .bind(&doc.key)
        .bind(doc.lot_id.get())
        .bind(doc.food_item_id.get())
        .bind(&doc.item_name)
        .bind(&doc.category)
        .bind(&doc.unit)
        .bind(doc.qty_on_hand)
        .bind(doc.location_id.get())
        .bind(&doc.location_name)
        .bind(doc.expiry_date)
        .bind(&doc.diets)
        .bind(doc.stamp.as_of)
        .bind(doc.stamp.cache_ttl_sec)
        .bind(doc.stamp.cache_valid_until)
        .bind(doc.stamp.cache_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to refresh inventory stamp"))?;

        if touched.rows_affected() > 0 {
            return Ok(UpsertOutcome::Unchanged);
        }

        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO inventory_cache (
                 key, lot_id, food_item_id, item_name, category, unit, qty_on_hand,
                 location_id, location_name, expiry_date, diets,
                 as_of, cache_ttl_sec, cache_valid_until, cache_status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (key) DO UPDATE SET
                 lot_id = EXCLUDED.lot_id,
                 food_item_id = EXCLUDED.food_item_id,
                 item_name = EXCLUDED.item_name,
                 category = EXCLUDED.category,
                 unit = EXCLUDED.unit,
                 qty_on_hand = EXCLUDED.qty_on_hand,
                 location_id = EXCLUDED.location_id,
                 location_name = EXCLUDED.location_name,
                 expiry_date = EXCLUDED.expiry_date,
                 diets = EXCLUDED.diets,
                 as_of = EXCLUDED.as_of,
                 cache_ttl_sec = EXCLUDED.cache_ttl_sec,
                 cache_valid_until = EXCLUDED.cache_valid_until,
                 cache_status = EXCLUDED.cache_status
             RETURNING (xmax = 0)",
        )
        .bind(&doc.key)
        .bind(doc.lot_id.get())
        .bind(doc.food_item_id.get())
        .bind(&doc.item_name)
        .bind(&doc.category)
        .bind(&doc.unit)
        .bind(doc.qty_on_hand)
        .bind(doc.location_id.get())
        .bind(&doc.location_name)
        .bind(doc.expiry_date)
        .bind(&doc.diets)
        .bind(doc.stamp.as_of)
        .bind(doc.stamp.cache_ttl_sec)
        .bind(doc.stamp.cache_valid_until)
        .bind(doc.stamp.cache_status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage("Failed to upsert inventory document"))?;

        Ok(outcome(inserted))
    }

    async fn inventory_keys(&self) -> Result<Vec<String>, CacheError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM inventory_cache")
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Failed to list inventory keys"))?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn remove_inventory(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM inventory_cache WHERE key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await
            .map_err(storage("Failed to remove inventory documents"))?;
        Ok(result.rows_affected())
    }

    async fn load_inventory(&self) -> Result<Vec<InventoryDocument>, CacheError> {
        let rows: Vec<InventoryCacheRow> = sqlx::query_as(
            "SELECT key, lot_id, food_item_id, item_name, category, unit, qty_on_hand,
                    location_id, location_name, expiry_date, diets,
                    as_of, cache_ttl_sec, cache_valid_until, cache_status
             FROM inventory_cache",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load inventory documents"))?;

        rows.into_iter()
            .map(|row| {
                Ok(InventoryDocument {
                    key: row.0,
                    lot_id: LotId::new(row.1),
                    food_item_id: FoodItemId::new(row.2),
                    item_name: row.3,
                    category: row.4,
                    unit: row.5,
                    qty_on_hand: row.6,
                    location_id: LocationId::new(row.7),
                    location_name: row.8,
                    expiry_date: row.9,
                    diets: row.10,
                    stamp: stamp(row.11, row.12, row.13, &row.14)?,
                })
            })
            .collect()
    }

    async fn upsert_history(&self, doc: &HistoryDocument) -> Result<UpsertOutcome, CacheError> {
        let items = serde_json::to_value(&doc.items)
            .map_err(|e| CacheError::Serialization(format!("Failed to encode history items: {e}")))?;

        let touched = sqlx::query(
            "UPDATE history_cache
             SET as_of = $8, cache_ttl_sec = $9, cache_valid_until = $10, cache_status = $11
             WHERE subject_key = $1 AND booking_id = $2
               AND location = $3 AND slot_start = $4 AND slot_end = $5
               AND status = $6 AND items = $7",
        )
        .bind(&doc.subject_key)
        .bind(doc.booking_id.get())
        .bind(&doc.location)
        .bind(doc.slot_start)
        .bind(doc.slot_end)
        .bind(doc.status.as_str())
        .bind(&items)
        .bind(doc.stamp.as_of)
        .bind(doc.stamp.cache_ttl_sec)
        .bind(doc.stamp.cache_valid_until)
        .bind(doc.stamp.cache_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to refresh history stamp"))?;

        if touched.rows_affected() > 0 {
            return Ok(UpsertOutcome::Unchanged);
        }

        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO history_cache (
                 subject_key, booking_id, location, slot_start, slot_end, status, items,
                 as_of, cache_ttl_sec, cache_valid_until, cache_status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (subject_key, booking_id) DO UPDATE SET
                 location = EXCLUDED.location,
                 slot_start = EXCLUDED.slot_start,
                 slot_end = EXCLUDED.slot_end,
                 status = EXCLUDED.status,
                 items = EXCLUDED.items,
                 as_of = EXCLUDED.as_of,
                 cache_ttl_sec = EXCLUDED.cache_ttl_sec,
                 cache_valid_until = EXCLUDED.cache_valid_until,
                 cache_status = EXCLUDED.cache_status
             RETURNING (xmax = 0)",
        )
        .bind(&doc.subject_key)
        .bind(doc.booking_id.get())
        .bind(&doc.location)
        .bind(doc.slot_start)
        .bind(doc.slot_end)
        .bind(doc.status.as_str())
        .bind(&items)
        .bind(doc.stamp.as_of)
        .bind(doc.stamp.cache_ttl_sec)
        .bind(doc.stamp.cache_valid_until)
        .bind(doc.stamp.cache_status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage("Failed to upsert history document"))?;

        Ok(outcome(inserted))
    }

    async fn retain_history(&self, subject_key: &str, keep: &[BookingId]) -> Result<u64, CacheError> {
        let keep: Vec<i64> = keep.iter().map(BookingId::get).collect();
        let result = sqlx::query(
            "DELETE FROM history_cache
             WHERE subject_key = $1 AND NOT (booking_id = ANY($2))",
        )
        .bind(subject_key)
        .bind(&keep)
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to prune history documents"))?;
        Ok(result.rows_affected())
    }

    async fn load_history(&self, subject_key: &str) -> Result<Vec<HistoryDocument>, CacheError> {
        let rows: Vec<HistoryCacheRow> = sqlx::query_as(
            "SELECT subject_key, booking_id, location, slot_start, slot_end, status, items,
                    as_of, cache_ttl_sec, cache_valid_until, cache_status
             FROM history_cache
             WHERE subject_key = $1",
        )
        .bind(subject_key)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to load history documents"))?;

        rows.into_iter()
            .map(|row| {
                let items: Vec<HistoryLine> = serde_json::from_value(row.6).map_err(|e| {
                    CacheError::Serialization(format!("Failed to decode history items: {e}"))
                })?;
                let status = BookingStatus::parse(&row.5)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                Ok(HistoryDocument {
                    subject_key: row.0,
                    booking_id: BookingId::new(row.1),
                    location: row.2,
                    slot_start: row.3,
                    slot_end: row.4,
                    status,
                    items,
                    stamp: stamp(row.7, row.8, row.9, &row.10)?,
                })
            })
            .collect()
    }
}
