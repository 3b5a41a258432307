//! In-memory cache store.

use crate::lock;
use pantry_core::cache::{CacheStore, HistoryDocument, InventoryDocument, UpsertOutcome};
use pantry_core::error::CacheError;
use pantry_core::types::BookingId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct CacheState {
    inventory: HashMap<String, InventoryDocument>,
    history: HashMap<(String, BookingId), HistoryDocument>,
    failing_keys: HashSet<String>,
    unavailable: bool,
}

impl CacheState {
    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable {
            Err(CacheError::Storage("cache unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// HashMap-backed cache store for fast, deterministic tests.
///
/// Clones share the same documents.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCacheStore {
    state: Arc<Mutex<CacheState>>,
}

impl InMemoryCacheStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make upserts of the document with this inventory key fail.
    pub fn fail_upserts_for(&self, key: &str) {
        lock(&self.state).failing_keys.insert(key.to_string());
    }

    /// Make every operation fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Number of cached inventory documents.
    #[must_use]
    pub fn inventory_len(&self) -> usize {
        lock(&self.state).inventory.len()
    }

    /// A cached inventory document by key.
    #[must_use]
    pub fn inventory_doc(&self, key: &str) -> Option<InventoryDocument> {
        lock(&self.state).inventory.get(key).cloned()
    }

    /// Number of cached history documents across all subjects.
    #[must_use]
    pub fn history_len(&self) -> usize {
        lock(&self.state).history.len()
    }
}

impl CacheStore for InMemoryCacheStore {
    async fn upsert_inventory(&self, doc: &InventoryDocument) -> Result<UpsertOutcome, CacheError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        if state.failing_keys.contains(&doc.key) {
            return Err(CacheError::Storage(format!("write rejected for {}", doc.key)));
        }

        let outcome = match state.inventory.get(&doc.key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.same_content(doc) => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        state.inventory.insert(doc.key.clone(), doc.clone());
        Ok(outcome)
    }

    async fn inventory_keys(&self) -> Result<Vec<String>, CacheError> {
        let state = lock(&self.state);
        state.check_available()?;
        Ok(state.inventory.keys().cloned().collect())
    }

    async fn remove_inventory(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        let removed = keys
            .iter()
            .filter(|key| state.inventory.remove(*key).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn load_inventory(&self) -> Result<Vec<InventoryDocument>, CacheError> {
        let state = lock(&self.state);
        state.check_available()?;
        Ok(state.inventory.values().cloned().collect())
    }

    async fn upsert_history(&self, doc: &HistoryDocument) -> Result<UpsertOutcome, CacheError> {
        let mut state = lock(&self.state);
        state.check_available()?;

        let key = (doc.subject_key.clone(), doc.booking_id);
        let outcome = match state.history.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing)
                if existing.status == doc.status
                    && existing.items == doc.items
                    && existing.location == doc.location
                    && existing.slot_start == doc.slot_start
                    && existing.slot_end == doc.slot_end =>
            {
                UpsertOutcome::Unchanged
            }
            Some(_) => UpsertOutcome::Updated,
        };
        state.history.insert(key, doc.clone());
        Ok(outcome)
    }

    async fn retain_history(&self, subject_key: &str, keep: &[BookingId]) -> Result<u64, CacheError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        let before = state.history.len();
        state
            .history
            .retain(|(subject, booking_id), _| subject != subject_key || keep.contains(booking_id));
        Ok((before - state.history.len()) as u64)
    }

    async fn load_history(&self, subject_key: &str) -> Result<Vec<HistoryDocument>, CacheError> {
        let state = lock(&self.state);
        state.check_available()?;
        Ok(state
            .history
            .values()
            .filter(|doc| doc.subject_key == subject_key)
            .cloned()
            .collect())
    }
}
