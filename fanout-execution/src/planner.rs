//! Deterministic lot-split across the accounts of an execution group.
//!
//! Rules, applied in order:
//! 1. fixed mappings get their `fixed_lots`, clipped to what remains in
//!    stable mapping order;
//! 2. the remainder is floor-split across weighted mappings (proportional
//!    mappings count as weight 1);
//! 3. leftover lots go one at a time to the largest fractional remainders,
//!    ties broken by mapping order;
//! 4. zero-lot mappings are dropped from the dispatchable slices but kept
//!    in the trace.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use fanout_core::{Allocation, AllocationPolicy, AllocationSlice, ExecutionGroup, Lots, PolicyTrace};

use crate::{ExecutionError, ExecutionResult};

/// Split `total_lots` across the group's mappings.
///
/// The result is deterministic for a given (group, total_lots) pair and
/// always sums to `total_lots` unless the fixed mappings alone exhaust it.
pub fn plan_allocation(group: &ExecutionGroup, total_lots: Lots) -> ExecutionResult<Allocation> {
    if total_lots == 0 {
        return Err(ExecutionError::AllocationInvalid(
            "total lots must be greater than zero".into(),
        ));
    }
    group.validate()?;
    if group.mappings.is_empty() {
        return Err(ExecutionError::NoEligibleAccounts);
    }

    let mut assigned: Vec<Lots> = vec![0; group.mappings.len()];
    let mut remaining = total_lots;

    // Rule 1: fixed mappings first, clipped in mapping order.
    for (index, mapping) in group.mappings.iter().enumerate() {
        if mapping.policy == AllocationPolicy::Fixed {
            let want = mapping.fixed_lots.unwrap_or(0);
            let take = want.min(remaining);
            assigned[index] = take;
            remaining -= take;
        }
    }

    // Rule 2: floor-split the remainder over the variable pool.
    let variable: Vec<(usize, Decimal)> = group
        .mappings
        .iter()
        .enumerate()
        .filter(|(_, mapping)| mapping.policy != AllocationPolicy::Fixed)
        .map(|(index, mapping)| {
            let weight = match mapping.policy {
                AllocationPolicy::Weighted => mapping.weight.unwrap_or(Decimal::ONE),
                _ => Decimal::ONE,
            };
            (index, weight)
        })
        .collect();

    if variable.is_empty() {
        if remaining > 0 {
            return Err(ExecutionError::AllocationInvalid(format!(
                "fixed allocations cover only {} of {} lots and no variable accounts remain",
                total_lots - remaining,
                total_lots
            )));
        }
    } else if remaining > 0 {
        let total_weight: Decimal = variable.iter().map(|(_, weight)| *weight).sum();
        if total_weight <= Decimal::ZERO {
            return Err(ExecutionError::AllocationInvalid(
                "allocation weights must be positive".into(),
            ));
        }
        let pool = Decimal::from(remaining);
        let mut leftover = remaining;
        let mut fractions: Vec<(usize, Decimal)> = Vec::with_capacity(variable.len());
        for (index, weight) in &variable {
            let share = pool * *weight / total_weight;
            let base = share.floor();
            let lots = base.to_u32().unwrap_or(0);
            assigned[*index] = lots;
            leftover -= lots;
            fractions.push((*index, share - base));
        }

        // Rule 3: largest fractional remainder wins the leftover lots;
        // sort is stable, so mapping order breaks ties.
        fractions.sort_by(|a, b| b.1.cmp(&a.1));
        let mut cursor = 0;
        while leftover > 0 {
            let (index, _) = fractions[cursor % fractions.len()];
            assigned[index] += 1;
            leftover -= 1;
            cursor += 1;
        }
    }

    let mut slices = Vec::new();
    let mut trace = Vec::new();
    for (index, mapping) in group.mappings.iter().enumerate() {
        let lots = assigned[index];
        trace.push(PolicyTrace {
            mapping_id: mapping.id,
            account_id: mapping.account_id,
            policy: mapping.policy,
            lots,
            note: (lots == 0).then(|| "no lots assigned".to_string()),
        });
        if lots > 0 {
            slices.push(AllocationSlice {
                mapping_id: mapping.id,
                account_id: mapping.account_id,
                link_id: mapping.link_id,
                lots,
                policy: mapping.policy,
                weight: mapping.weight,
                fixed_lots: mapping.fixed_lots,
            });
        }
    }

    let allocation = Allocation {
        total_lots,
        slices,
        trace,
    };
    if allocation.is_empty() {
        return Err(ExecutionError::NoEligibleAccounts);
    }
    let assigned_total = allocation.assigned_lots();
    if assigned_total != total_lots {
        // Fixed mappings may legitimately clip the total; anything else is
        // an invariant violation.
        let clipped_by_fixed = group
            .mappings
            .iter()
            .any(|mapping| mapping.policy == AllocationPolicy::Fixed)
            && assigned_total < total_lots;
        if !clipped_by_fixed {
            return Err(ExecutionError::Internal(format!(
                "allocation assigned {assigned_total} of {total_lots} lots"
            )));
        }
    }
    Ok(allocation)
}
