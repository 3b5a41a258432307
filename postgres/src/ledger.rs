//! `PostgreSQL` implementation of the authoritative ledger.

use chrono::{DateTime, NaiveDate, Utc};
use pantry_core::error::LedgerError;
use pantry_core::ledger::{Ledger, LedgerUnitOfWork};
use pantry_core::types::{
    Allocation, BookingHistory, BookingId, BookingStatus, FoodItemId, HistoryLine, HouseholdId,
    InventoryRow, Location, LocationId, Lot, LotId, NewBooking, Quantity, SlotWindow, UserId,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;

/// SQLSTATE raised by an `EXCLUDE` constraint.
const EXCLUSION_VIOLATION: &str = "23P01";

fn is_exclusion_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(EXCLUSION_VIOLATION))
}

/// `PostgreSQL`-backed ledger.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool.
    ///
    /// Useful for health checks or manual queries.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type BookingRow = (i64, i64, String, DateTime<Utc>, DateTime<Utc>, String, DateTime<Utc>);
type LineRow = (i64, i64, String, String, i32, i32);
type InventoryTuple = (
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
);

impl Ledger for PostgresLedger {
    type UnitOfWork = PostgresUnitOfWork;

    async fn begin(&self) -> Result<PostgresUnitOfWork, LedgerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to start transaction: {e}")))?;
        Ok(PostgresUnitOfWork { tx, booking: None })
    }

    async fn find_location(&self, location_id: LocationId) -> Result<Option<Location>, LedgerError> {
        let row: Option<(i64, String, bool)> =
            sqlx::query_as("SELECT id, name, active FROM locations WHERE id = $1")
                .bind(location_id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| LedgerError::Storage(format!("Failed to load location: {e}")))?;

        Ok(row.map(|(id, name, active)| Location {
            id: LocationId::new(id),
            name,
            active,
        }))
    }

    async fn latest_household(&self, user_id: UserId) -> Result<Option<HouseholdId>, LedgerError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT household_id
             FROM household_members
             WHERE user_id = $1
             ORDER BY joined_at DESC, household_id DESC
             LIMIT 1",
        )
        .bind(user_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to resolve household: {e}")))?;

        Ok(row.map(|(id,)| HouseholdId::new(id)))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn booking_history(&self, user_id: UserId) -> Result<Vec<BookingHistory>, LedgerError> {
        let bookings: Vec<BookingRow> = sqlx::query_as(
            "SELECT b.id, b.location_id, l.name, b.slot_start, b.slot_end, b.status, b.created_at
             FROM bookings b
             JOIN locations l ON l.id = b.location_id
             WHERE b.household_id IN (
                 SELECT household_id FROM household_members WHERE user_id = $1
             )
             ORDER BY b.slot_start DESC, b.id DESC",
        )
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to load bookings: {e}")))?;

        if bookings.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = bookings.iter().map(|row| row.0).collect();
        let lines: Vec<LineRow> = sqlx::query_as(
            "SELECT bi.booking_id, bi.food_item_id, f.name, f.unit,
                    SUM(bi.qty_allocated)::INT4, SUM(bi.qty_collected)::INT4
             FROM booking_items bi
             JOIN food_items f ON f.id = bi.food_item_id
             WHERE bi.booking_id = ANY($1)
             GROUP BY bi.booking_id, bi.food_item_id, f.name, f.unit
             ORDER BY bi.booking_id, bi.food_item_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to load booking lines: {e}")))?;

        let mut lines_by_booking: HashMap<i64, Vec<HistoryLine>> = HashMap::new();
        for (booking_id, item_id, name, unit, qty_allocated, qty_collected) in lines {
            lines_by_booking.entry(booking_id).or_default().push(HistoryLine {
                item_id: FoodItemId::new(item_id),
                name,
                unit,
                qty_allocated,
                qty_collected,
            });
        }

        bookings
            .into_iter()
            .map(|(id, location_id, location_name, start, end, status, created_at)| {
                let slot = SlotWindow::new(start, end)
                    .map_err(|e| LedgerError::Storage(format!("Corrupt booking {id}: {e}")))?;
                Ok(BookingHistory {
                    booking_id: BookingId::new(id),
                    location_id: LocationId::new(location_id),
                    location_name,
                    slot,
                    status: BookingStatus::parse(&status)?,
                    created_at,
                    items: lines_by_booking.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn inventory_snapshot(&self) -> Result<Vec<InventoryRow>, LedgerError> {
        let rows: Vec<InventoryTuple> = sqlx::query_as(
            "SELECT lo.id, lo.food_item_id, f.name, f.category, f.unit, lo.quantity_on_hand,
                    lo.location_id, l.name, lo.expiry_date,
                    COALESCE(
                        array_agg(d.diet ORDER BY d.diet) FILTER (WHERE d.diet IS NOT NULL),
                        '{}'
                    ) AS diets
             FROM lots lo
             JOIN food_items f ON f.id = lo.food_item_id
             JOIN locations l ON l.id = lo.location_id AND l.active
             LEFT JOIN food_item_diets d ON d.food_item_id = f.id
             GROUP BY lo.id, f.id, l.id
             ORDER BY lo.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to read inventory: {e}")))?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    lot_id,
                    food_item_id,
                    item_name,
                    category,
                    unit,
                    qty_on_hand,
                    location_id,
                    location_name,
                    expiry_date,
                    diets,
                )| InventoryRow {
                    lot_id: LotId::new(lot_id),
                    food_item_id: FoodItemId::new(food_item_id),
                    item_name,
                    category,
                    unit,
                    qty_on_hand,
                    location_id: LocationId::new(location_id),
                    location_name,
                    expiry_date,
                    diets,
                },
            )
            .collect())
    }
}

/// One booking transaction.
///
/// Dropping it without [`LedgerUnitOfWork::commit`] rolls the transaction back.
#[derive(Debug)]
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    booking: Option<(HouseholdId, LocationId)>,
}

impl PostgresUnitOfWork {
    fn exclusion_or_storage(&self, err: &sqlx::Error, context: &str) -> LedgerError {
        match self.booking {
            Some((household_id, location_id)) if is_exclusion_violation(err) => {
                LedgerError::ExclusionViolated {
                    household_id,
                    location_id,
                }
            }
            _ => LedgerError::Storage(format!("{context}: {err}")),
        }
    }
}

impl LedgerUnitOfWork for PostgresUnitOfWork {
    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, LedgerError> {
        self.booking = Some((booking.household_id, booking.location_id));

        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO bookings (household_id, location_id, slot_start, slot_end, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(booking.household_id.get())
        .bind(booking.location_id.get())
        .bind(booking.slot.start())
        .bind(booking.slot.end())
        .bind(BookingStatus::Pending.as_str())
        .bind(booking.created_at)
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            Ok((id,)) => Ok(BookingId::new(id)),
            Err(e) => Err(self.exclusion_or_storage(&e, "Failed to insert booking")),
        }
    }

    async fn fefo_lots(
        &mut self,
        location_id: LocationId,
        food_item_id: FoodItemId,
    ) -> Result<Vec<Lot>, LedgerError> {
        let rows: Vec<(i64, i32, NaiveDate)> = sqlx::query_as(
            "SELECT id, quantity_on_hand, expiry_date
             FROM lots
             WHERE location_id = $1 AND food_item_id = $2 AND quantity_on_hand > 0
             ORDER BY expiry_date ASC, id ASC",
        )
        .bind(location_id.get())
        .bind(food_item_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to read lots: {e}")))?;

        rows.into_iter()
            .map(|(id, qty, expiry)| {
                Lot::new(LotId::new(id), food_item_id, location_id, qty, expiry)
            })
            .collect()
    }

    async fn decrement(&mut self, lot_id: LotId, qty: Quantity) -> Result<(), LedgerError> {
        let updated: Option<(i32,)> = sqlx::query_as(
            "UPDATE lots
             SET quantity_on_hand = quantity_on_hand - $2
             WHERE id = $1 AND quantity_on_hand >= $2
             RETURNING quantity_on_hand",
        )
        .bind(lot_id.get())
        .bind(qty.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to decrement lot {lot_id}: {e}")))?;

        if updated.is_some() {
            return Ok(());
        }

        // Zero rows: either the lot is gone or someone else took the stock.
        let current: Option<(i32,)> =
            sqlx::query_as("SELECT quantity_on_hand FROM lots WHERE id = $1")
                .bind(lot_id.get())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| LedgerError::Storage(format!("Failed to read lot {lot_id}: {e}")))?;

        match current {
            Some((available,)) => {
                tracing::debug!(
                    lot_id = %lot_id,
                    requested = qty.get(),
                    available,
                    "Conditional decrement lost the race"
                );
                Err(LedgerError::InsufficientQuantity {
                    lot_id,
                    requested: qty.get(),
                    available,
                })
            }
            None => Err(LedgerError::NotFound(format!("lot {lot_id}"))),
        }
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO booking_items (booking_id, lot_id, food_item_id, qty_allocated, qty_collected)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(allocation.booking_id.get())
        .bind(allocation.lot_id.get())
        .bind(allocation.food_item_id.get())
        .bind(allocation.qty_allocated().get())
        .bind(allocation.qty_collected())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to insert allocation: {e}")))?;

        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        let booking = self.booking;
        self.tx.commit().await.map_err(|e| match booking {
            Some((household_id, location_id)) if is_exclusion_violation(&e) => {
                LedgerError::ExclusionViolated {
                    household_id,
                    location_id,
                }
            }
            _ => LedgerError::Storage(format!("Failed to commit transaction: {e}")),
        })
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to roll back transaction: {e}")))
    }
}
