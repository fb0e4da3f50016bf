//! Deterministic lot allocation produced by the planner.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, AllocationPolicy, LinkId, Lots, MappingId};

/// One account's share of a fan-out order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationSlice {
    pub mapping_id: MappingId,
    pub account_id: AccountId,
    pub link_id: LinkId,
    pub lots: Lots,
    pub policy: AllocationPolicy,
    pub weight: Option<Decimal>,
    pub fixed_lots: Option<Lots>,
}

/// Record of how every mapping fared during planning, including accounts
/// that ended up with zero lots and were therefore not dispatched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PolicyTrace {
    pub mapping_id: MappingId,
    pub account_id: AccountId,
    pub policy: AllocationPolicy,
    pub lots: Lots,
    pub note: Option<String>,
}

/// Ordered result of splitting `total_lots` across a group.
///
/// `slices` contains only dispatchable entries (lots >= 1) in deterministic
/// order; `trace` retains every mapping for observability.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Allocation {
    pub total_lots: Lots,
    pub slices: Vec<AllocationSlice>,
    pub trace: Vec<PolicyTrace>,
}

impl Allocation {
    /// Sum of lots across dispatchable slices.
    #[must_use]
    pub fn assigned_lots(&self) -> Lots {
        self.slices.iter().map(|slice| slice.lots).sum()
    }

    /// True when nothing survived planning.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}
