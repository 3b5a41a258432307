//! First-Expired-First-Out allocation planning.
//!
//! Pure planning: given the lots of one item at one location, decide how many
//! units to take from each. Nothing here touches the ledger; the coordinator
//! applies the plan through atomic decrements.
//!
//! ```text
//! requested 8, lots: [lot1: 5 @ 2024-01-01] [lot2: 10 @ 2024-02-01]
//!                     ───── take 5 ─────    ───── take 3 ─────
//! ```
//!
//! When the lots run out first, the plan is partial (possibly empty). That is
//! not an error: the booking still commits with whatever could be allocated.

use crate::types::{FoodItemId, Lot, LotId, Quantity};
use serde::{Deserialize, Serialize};

/// One step of an allocation plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStep {
    /// Lot to draw from
    pub lot_id: LotId,
    /// Units to take
    pub qty_taken: Quantity,
}

/// The result of planning one requested line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// Item requested
    pub food_item_id: FoodItemId,
    /// Units requested
    pub requested: Quantity,
    /// Steps in consumption order
    pub steps: Vec<AllocationStep>,
}

impl AllocationPlan {
    /// Total units the plan takes.
    #[must_use]
    pub fn allocated(&self) -> i32 {
        self.steps.iter().map(|s| s.qty_taken.get()).sum()
    }

    /// Units requested but not covered by any lot.
    #[must_use]
    pub fn shortfall(&self) -> i32 {
        self.requested.get() - self.allocated()
    }

    /// Whether every requested unit is covered.
    #[must_use]
    pub fn is_fully_satisfied(&self) -> bool {
        self.shortfall() == 0
    }
}

/// Plan an allocation of `requested` units of `food_item_id` over `lots`.
///
/// Lots of other items and empty lots are ignored. The remaining lots are
/// consumed in ascending `(expiry_date, lot_id)` order regardless of the order
/// they were passed in, so the plan is reproducible.
#[must_use]
pub fn allocate(food_item_id: FoodItemId, requested: Quantity, lots: &[Lot]) -> AllocationPlan {
    let mut candidates: Vec<&Lot> = lots
        .iter()
        .filter(|lot| lot.food_item_id == food_item_id && lot.quantity_on_hand() > 0)
        .collect();
    candidates.sort_by_key(|lot| lot.fefo_key());

    let mut remaining = requested.get();
    let mut steps = Vec::new();
    for lot in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(lot.quantity_on_hand());
        // take > 0: remaining > 0 and the lot has stock
        if let Ok(qty_taken) = Quantity::new(take) {
            steps.push(AllocationStep {
                lot_id: lot.lot_id,
                qty_taken,
            });
            remaining -= take;
        }
    }

    AllocationPlan {
        food_item_id,
        requested,
        steps,
    }
}
