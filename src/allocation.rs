// Allocation Ledger - quota consumption across the fiscal year
//
// Combines the allocation registry with FY-windowed throughput to answer
// "how much of this year's quota is left". The throughput window extends its
// predecessor lookback one calendar month before the fiscal start so July can
// still diff against the last pre-FY snapshot.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::fiscal::{months_before, FiscalWindow};
use crate::store::{AllocationSource, SnapshotSource};
use crate::throughput::{monthly_processed_totals, MonthlyTotal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FyProcessed {
    pub fy_label: String,
    pub total: i64,
    pub breakdown: Vec<MonthlyTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemainingAllocation {
    pub fy_label: String,
    /// Fiscal year the allocation row was taken from; differs from the
    /// current FY when the fallback to the most recent known row applied.
    pub allocation_fy_start: i32,
    pub total_allocation: i64,
    pub total_processed: i64,
    /// Never negative, even when processing overshot the allocation.
    pub remaining: i64,
    /// 0-100 (may exceed 100 on overshoot); 0.0 when the allocation is zero.
    pub pct_used: f64,
}

/// Processed counts for the current fiscal year, by month.
pub fn total_processed_this_fy(
    store: &impl SnapshotSource,
    code: &str,
    today: NaiveDate,
) -> Result<FyProcessed> {
    let entity = store.entity(code)?;
    let fy = FiscalWindow::containing(today);

    // Lookback starts one month before the FY so the first FY month has a
    // predecessor to diff against; pre-FY months are then dropped.
    let lookback_start = months_before(fy.start, 1);
    let breakdown: Vec<MonthlyTotal> =
        monthly_processed_totals(&store.cohort_series(entity.id)?, Some(lookback_start), Some(fy.end))
            .into_iter()
            .filter(|mt| mt.month >= fy.start)
            .collect();

    Ok(FyProcessed {
        fy_label: fy.label,
        total: breakdown.iter().map(|mt| mt.total).sum(),
        breakdown,
    })
}

/// Remaining quota for the current fiscal year. Prefers the current FY's
/// allocation row; falls back to the most recent known row when the current
/// year has none. No row in any year signals `NoAllocation`.
pub fn remaining_allocation(
    store: &(impl SnapshotSource + AllocationSource),
    code: &str,
    today: NaiveDate,
) -> Result<RemainingAllocation> {
    let entity = store.entity(code)?;
    let fy = FiscalWindow::containing(today);

    let allocation = match store.allocation_for(entity.id, fy.start_year)? {
        Some(row) => row,
        None => store
            .latest_allocation(entity.id)?
            .ok_or_else(|| EngineError::NoAllocation(code.to_string()))?,
    };

    let processed = total_processed_this_fy(store, code, today)?;

    let pct_used = if allocation.allocation_amount > 0 {
        processed.total as f64 / allocation.allocation_amount as f64 * 100.0
    } else {
        0.0
    };

    Ok(RemainingAllocation {
        fy_label: fy.label,
        allocation_fy_start: allocation.fiscal_year_start,
        total_allocation: allocation.allocation_amount,
        total_processed: processed.total,
        remaining: (allocation.allocation_amount - processed.total).max(0),
        pct_used,
    })
}
