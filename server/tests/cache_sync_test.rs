//! Cache synchronizer tests against the in-memory ledger and cache store.
//!
//! Verifies idempotent refreshes, reconciliation, per-document failure
//! isolation, single-flight bulk refreshes and staleness evaluation.
//!
//! Run with: `cargo test --test cache_sync_test`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use chrono::{DateTime, Duration, Utc};
use pantry_core::cache::{CacheStamp, CacheStatus, CacheStore, HistoryDocument, InventoryFilter};
use pantry_core::error::LedgerError;
use pantry_core::ledger::Ledger;
use pantry_core::types::{
    BookingHistory, BookingId, BookingStatus, HouseholdId, InventoryRow, Location, LocationId,
    UserId,
};
use pantry_server::{
    BookingCoordinator, BulkRefresh, CacheSynchronizer, CreateBooking, RefreshOptions,
    RefreshReport, RequestedItem, SyncError,
};
use pantry_testing::fixtures::{at, date, food_item, location, lot};
use pantry_testing::mocks::ManualClock;
use pantry_testing::{InMemoryCacheStore, InMemoryLedger, InMemoryUnitOfWork};
use std::sync::Arc;
use tokio::sync::Notify;

const RICE: i64 = 7;
const BEANS: i64 = 8;
const MILK: i64 = 9;

fn t0() -> DateTime<Utc> {
    at(2024, 1, 9, 12)
}

/// Two locations, three items, four lots.
fn seeded_ledger() -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    ledger.add_location(location(1, "Main St"));
    ledger.add_location(location(2, "Harbor"));
    ledger.add_food_item(food_item(RICE, "Brown Rice", "Grains", "kg", &["vegan"]));
    ledger.add_food_item(food_item(BEANS, "Black beans", "Legumes", "can", &["vegan", "halal"]));
    ledger.add_food_item(food_item(MILK, "Oat milk", "Dairy alternatives", "l", &[]));
    ledger.add_lot(lot(1, RICE, 1, 5, date(2024, 1, 20)));
    ledger.add_lot(lot(2, BEANS, 1, 0, date(2024, 1, 12)));
    ledger.add_lot(lot(3, MILK, 1, 4, date(2024, 1, 15)));
    ledger.add_lot(lot(4, RICE, 2, 9, date(2024, 1, 12)));
    ledger.add_member(UserId::new(100), HouseholdId::new(10), at(2023, 6, 1, 0));
    ledger
}

struct Harness {
    ledger: InMemoryLedger,
    cache: InMemoryCacheStore,
    clock: ManualClock,
    synchronizer: CacheSynchronizer<InMemoryLedger, InMemoryCacheStore>,
}

fn harness() -> Harness {
    let ledger = seeded_ledger();
    let cache = InMemoryCacheStore::new();
    let clock = ManualClock::new(t0());
    let synchronizer = CacheSynchronizer::new(ledger.clone(), cache.clone(), Arc::new(clock.clone()));
    Harness {
        ledger,
        cache,
        clock,
        synchronizer,
    }
}

async fn refresh(synchronizer: &CacheSynchronizer<InMemoryLedger, InMemoryCacheStore>, options: RefreshOptions) -> RefreshReport {
    match synchronizer.refresh_inventory(options).await.unwrap() {
        BulkRefresh::Completed(report) => report,
        BulkRefresh::AlreadyRunning => panic!("no other refresh should be running"),
    }
}

async fn book(ledger: &InMemoryLedger, household: Option<i64>, from_hour: i64, items: &[(i64, i32)]) -> BookingId {
    let coordinator = BookingCoordinator::new(ledger.clone(), Arc::new(ManualClock::new(t0())));
    let day = at(2024, 1, 10, 0);
    coordinator
        .create_booking(CreateBooking {
            user_id: UserId::new(100),
            location_id: LocationId::new(1),
            slot_start: day + Duration::hours(from_hour),
            slot_end: day + Duration::hours(from_hour + 1),
            household_id: household.map(HouseholdId::new),
            items: items
                .iter()
                .map(|&(food_item_id, qty)| RequestedItem { food_item_id, qty })
                .collect(),
        })
        .await
        .unwrap()
        .booking_id
}

// ============================================================================
// Inventory refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let h = harness();

    let first = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(first.count, 4);
    assert_eq!(first.upserted, 4);
    assert_eq!(first.unchanged, 0);
    assert_eq!(first.failed, 0);

    h.clock.advance(Duration::seconds(30));
    let second = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(second.count, 4);
    assert_eq!(second.upserted, 0);
    assert_eq!(second.unchanged, 4);
    assert_eq!(second.removed, 0);

    assert_eq!(h.cache.inventory_len(), 4);
    // Only the stamp moved.
    let doc = h.cache.inventory_doc("lot:1").unwrap();
    assert_eq!(doc.stamp.as_of, t0() + Duration::seconds(30));
}

#[tokio::test]
async fn test_refresh_stamps_documents() {
    let h = harness();
    let options = RefreshOptions {
        reconcile_deletes: true,
        ttl_sec: 120,
    };

    refresh(&h.synchronizer, options).await;

    let doc = h.cache.inventory_doc("lot:4").unwrap();
    assert_eq!(doc.item_name, "Brown Rice");
    assert_eq!(doc.location_name, "Harbor");
    assert_eq!(doc.qty_on_hand, 9);
    assert_eq!(doc.diets, vec!["vegan".to_string()]);
    assert_eq!(doc.stamp.as_of, t0());
    assert_eq!(doc.stamp.cache_ttl_sec, 120);
    assert_eq!(doc.stamp.cache_valid_until, t0() + Duration::seconds(120));
    assert_eq!(doc.stamp.cache_status, CacheStatus::Fresh);
}

#[tokio::test]
async fn test_refresh_picks_up_committed_booking() {
    let h = harness();
    refresh(&h.synchronizer, RefreshOptions::default()).await;

    book(&h.ledger, None, 10, &[(RICE, 2)]).await;

    let report = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(report.upserted, 1);
    assert_eq!(report.unchanged, 3);
    assert_eq!(h.cache.inventory_doc("lot:1").unwrap().qty_on_hand, 3);
}

#[tokio::test]
async fn test_reconciliation_removes_orphans() {
    let h = harness();
    refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(h.cache.inventory_len(), 4);

    h.ledger.set_location_active(LocationId::new(2), false);

    let kept = refresh(
        &h.synchronizer,
        RefreshOptions {
            reconcile_deletes: false,
            ttl_sec: 300,
        },
    )
    .await;
    assert_eq!(kept.count, 3);
    assert_eq!(kept.removed, 0);
    assert_eq!(h.cache.inventory_len(), 4);

    let pruned = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(pruned.removed, 1);
    assert_eq!(h.cache.inventory_len(), 3);
    assert!(h.cache.inventory_doc("lot:4").is_none());
}

#[tokio::test]
async fn test_document_failure_is_skipped() {
    let h = harness();
    h.cache.fail_upserts_for("lot:2");

    let report = refresh(&h.synchronizer, RefreshOptions::default()).await;

    assert_eq!(report.count, 4);
    assert_eq!(report.upserted, 3);
    assert_eq!(report.failed, 1);
    assert!(h.cache.inventory_doc("lot:2").is_none());
    assert!(h.cache.inventory_doc("lot:3").is_some());
}

#[tokio::test]
async fn test_unreachable_sources_abort_refresh() {
    let h = harness();

    h.ledger.set_unavailable(true);
    let err = h.synchronizer.refresh_inventory(RefreshOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::Ledger(LedgerError::Storage(_))));
    assert_eq!(h.cache.inventory_len(), 0);

    h.ledger.set_unavailable(false);
    h.cache.set_unavailable(true);
    let err = h.synchronizer.refresh_inventory(RefreshOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::Cache(_)));

    h.cache.set_unavailable(false);
    let report = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(report.upserted, 4);
}

#[tokio::test]
async fn test_unusable_ttl_is_rejected() {
    let h = harness();

    for ttl_sec in [0, -60, 10_000_000_000_000, i64::MAX] {
        let options = RefreshOptions {
            reconcile_deletes: true,
            ttl_sec,
        };
        let err = h.synchronizer.refresh_inventory(options).await.unwrap_err();
        assert_eq!(err, SyncError::InvalidTtl(ttl_sec));

        let err = h.synchronizer.refresh_history(UserId::new(100), ttl_sec).await.unwrap_err();
        assert_eq!(err, SyncError::InvalidTtl(ttl_sec));
    }
    assert_eq!(h.cache.inventory_len(), 0);
    assert_eq!(h.cache.history_len(), 0);

    // A rejected call leaves the single-flight permit free.
    let report = refresh(&h.synchronizer, RefreshOptions::default()).await;
    assert_eq!(report.upserted, 4);
}

#[tokio::test]
async fn test_oversized_ttl_does_not_kill_spawned_refresh() {
    let h = harness();
    let synchronizer = Arc::new(h.synchronizer);

    let task = tokio::spawn({
        let synchronizer = Arc::clone(&synchronizer);
        async move {
            synchronizer
                .refresh_inventory(RefreshOptions {
                    reconcile_deletes: false,
                    ttl_sec: 10_000_000_000_000,
                })
                .await
        }
    });

    let result = task.await.expect("refresh task must not panic");
    assert!(matches!(result, Err(SyncError::InvalidTtl(_))));
}

/// Delegates to an in-memory ledger but parks every snapshot until released.
#[derive(Clone)]
struct ParkedSnapshotLedger {
    inner: InMemoryLedger,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Ledger for ParkedSnapshotLedger {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::UnitOfWork, LedgerError> {
        self.inner.begin().await
    }

    async fn find_location(&self, location_id: LocationId) -> Result<Option<Location>, LedgerError> {
        self.inner.find_location(location_id).await
    }

    async fn latest_household(&self, user_id: UserId) -> Result<Option<HouseholdId>, LedgerError> {
        self.inner.latest_household(user_id).await
    }

    async fn booking_history(&self, user_id: UserId) -> Result<Vec<BookingHistory>, LedgerError> {
        self.inner.booking_history(user_id).await
    }

    async fn inventory_snapshot(&self) -> Result<Vec<InventoryRow>, LedgerError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.inventory_snapshot().await
    }
}

#[tokio::test]
async fn test_bulk_refresh_is_single_flight() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let cache = InMemoryCacheStore::new();
    let synchronizer = Arc::new(CacheSynchronizer::new(
        ParkedSnapshotLedger {
            inner: seeded_ledger(),
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        },
        cache.clone(),
        Arc::new(ManualClock::new(t0())),
    ));

    let running = tokio::spawn({
        let synchronizer = Arc::clone(&synchronizer);
        async move { synchronizer.refresh_inventory(RefreshOptions::default()).await }
    });
    entered.notified().await;

    let overlapping = synchronizer.refresh_inventory(RefreshOptions::default()).await.unwrap();
    assert_eq!(overlapping, BulkRefresh::AlreadyRunning);

    release.notify_one();
    let finished = running.await.unwrap().unwrap();
    assert!(matches!(finished, BulkRefresh::Completed(report) if report.upserted == 4));
    assert_eq!(cache.inventory_len(), 4);

    // The permit is back once the first run finished.
    release.notify_one();
    let again = synchronizer.refresh_inventory(RefreshOptions::default()).await.unwrap();
    assert!(matches!(again, BulkRefresh::Completed(report) if report.unchanged == 4));
}

// ============================================================================
// Inventory reads
// ============================================================================

#[tokio::test]
async fn test_read_inventory_sorts_by_expiry_then_key() {
    let h = harness();
    refresh(&h.synchronizer, RefreshOptions::default()).await;

    let docs = h.synchronizer.read_inventory(&InventoryFilter::default()).await.unwrap();
    let keys: Vec<&str> = docs.iter().map(|d| d.key.as_str()).collect();

    // lot:2 and lot:4 share an expiry date.
    assert_eq!(keys, vec!["lot:2", "lot:4", "lot:3", "lot:1"]);
}

#[tokio::test]
async fn test_read_inventory_filters() {
    let h = harness();
    refresh(&h.synchronizer, RefreshOptions::default()).await;

    let keys = |docs: Vec<pantry_core::cache::InventoryDocument>| -> Vec<String> {
        docs.into_iter().map(|d| d.key).collect()
    };

    let search = InventoryFilter {
        search: Some("RICE".to_string()),
        ..InventoryFilter::default()
    };
    assert_eq!(
        keys(h.synchronizer.read_inventory(&search).await.unwrap()),
        vec!["lot:4", "lot:1"]
    );

    // Search also matches the category.
    let by_category_text = InventoryFilter {
        search: Some("legum".to_string()),
        ..InventoryFilter::default()
    };
    assert_eq!(
        keys(h.synchronizer.read_inventory(&by_category_text).await.unwrap()),
        vec!["lot:2"]
    );

    let halal_in_stock = InventoryFilter {
        diet: Some("Halal".to_string()),
        in_stock_only: true,
        ..InventoryFilter::default()
    };
    assert!(h.synchronizer.read_inventory(&halal_in_stock).await.unwrap().is_empty());

    let category = InventoryFilter {
        category: Some("dairy alternatives".to_string()),
        ..InventoryFilter::default()
    };
    assert_eq!(
        keys(h.synchronizer.read_inventory(&category).await.unwrap()),
        vec!["lot:3"]
    );

    let blank = InventoryFilter {
        search: Some("   ".to_string()),
        ..InventoryFilter::default()
    };
    assert_eq!(h.synchronizer.read_inventory(&blank).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_read_inventory_reports_staleness() {
    let h = harness();
    let options = RefreshOptions {
        reconcile_deletes: true,
        ttl_sec: 300,
    };
    refresh(&h.synchronizer, options).await;

    let status = |docs: Vec<pantry_core::cache::InventoryDocument>| docs[0].stamp.cache_status;

    let all = InventoryFilter::default();
    let read = || h.synchronizer.read_inventory(&all);
    assert_eq!(status(read().await.unwrap()), CacheStatus::Fresh);

    h.clock.advance(Duration::seconds(299));
    assert_eq!(status(read().await.unwrap()), CacheStatus::Fresh);

    h.clock.advance(Duration::seconds(1));
    assert_eq!(status(read().await.unwrap()), CacheStatus::Stale);

    h.clock.set(t0() + Duration::seconds(599));
    assert_eq!(status(read().await.unwrap()), CacheStatus::Stale);

    h.clock.set(t0() + Duration::seconds(600));
    assert_eq!(status(read().await.unwrap()), CacheStatus::Expired);

    // Reading does not rewrite the stored stamp.
    assert_eq!(
        h.cache.inventory_doc("lot:1").unwrap().stamp.cache_status,
        CacheStatus::Fresh
    );
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_history_refresh_and_read() {
    let h = harness();
    let early = book(&h.ledger, None, 9, &[(RICE, 2)]).await;
    let late = book(&h.ledger, None, 14, &[(MILK, 1), (RICE, 1)]).await;

    let report = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();
    assert_eq!(report.count, 2);
    assert_eq!(report.upserted, 2);

    let docs = h.synchronizer.read_history(UserId::new(100)).await.unwrap();
    let ids: Vec<BookingId> = docs.iter().map(|d| d.booking_id).collect();
    assert_eq!(ids, vec![late, early]);
    assert_eq!(docs[0].subject_key, "user:100");
    assert_eq!(docs[0].location, "Main St");
    assert_eq!(docs[0].items.len(), 2);
    assert_eq!(docs[0].stamp.cache_ttl_sec, 120);

    let again = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();
    assert_eq!(again.upserted, 0);
    assert_eq!(again.unchanged, 2);
}

#[tokio::test]
async fn test_history_reflects_status_changes() {
    let h = harness();
    let booking_id = book(&h.ledger, None, 9, &[(RICE, 1)]).await;
    h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();

    h.ledger.set_booking_status(booking_id, BookingStatus::Cancelled);
    let report = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();
    assert_eq!(report.upserted, 1);

    let docs = h.synchronizer.read_history(UserId::new(100)).await.unwrap();
    assert_eq!(docs[0].status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn test_history_spans_every_household() {
    let h = harness();
    h.ledger.add_member(UserId::new(100), HouseholdId::new(11), at(2023, 9, 1, 0));
    book(&h.ledger, Some(10), 9, &[(RICE, 1)]).await;
    book(&h.ledger, Some(11), 9, &[(RICE, 1)]).await;

    let report = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();
    assert_eq!(report.count, 2);
    assert_eq!(h.cache.history_len(), 2);
}

#[tokio::test]
async fn test_history_refresh_prunes_vanished_bookings() {
    let h = harness();
    book(&h.ledger, None, 9, &[(RICE, 1)]).await;

    let ghost = HistoryDocument {
        subject_key: HistoryDocument::subject_key_for(UserId::new(100)),
        booking_id: BookingId::new(999),
        location: "Main St".to_string(),
        slot_start: t0(),
        slot_end: t0() + Duration::hours(1),
        status: BookingStatus::Pending,
        items: Vec::new(),
        stamp: CacheStamp::fresh(t0(), 120).unwrap(),
    };
    h.cache.upsert_history(&ghost).await.unwrap();

    // Another user's documents are left alone.
    let other = HistoryDocument {
        subject_key: HistoryDocument::subject_key_for(UserId::new(200)),
        ..ghost.clone()
    };
    h.cache.upsert_history(&other).await.unwrap();

    let report = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(h.cache.history_len(), 2);

    let docs = h.synchronizer.read_history(UserId::new(100)).await.unwrap();
    assert!(docs.iter().all(|d| d.booking_id != BookingId::new(999)));
}

#[tokio::test]
async fn test_history_refresh_fails_without_ledger() {
    let h = harness();
    h.ledger.set_unavailable(true);

    let err = h.synchronizer.refresh_history(UserId::new(100), 120).await.unwrap_err();
    assert!(matches!(err, SyncError::Ledger(_)));
}
