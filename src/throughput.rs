// Throughput Calculator - derive processed counts from consecutive snapshots
//
// The central primitive: a cohort that had N outstanding last observation and
// M outstanding this observation processed max(0, N - M) items in between.
// Snapshots are irregular, so "last observation" means the most recent
// earlier snapshot inside the requested window, never "previous calendar
// month". Every derived metric (monthly totals, running average, weighted
// average, the forecast rate) is built on this differencing.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::fiscal::month_floor;
use crate::store::{CohortSeries, Snapshot, SnapshotSource};

/// Lookback window for the weighted average: the most recent qualifying
/// months feeding the forecast rate.
pub const WEIGHTED_WINDOW: usize = 3;

// ============================================================================
// RESULT SHAPES
// ============================================================================

/// One cohort's share of a month's processed total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CohortContribution {
    pub lodged_period: NaiveDate,
    pub processed: i64,
}

/// Items processed across all cohorts in one observation month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotal {
    pub month: NaiveDate,
    pub total: i64,
    pub breakdown: Vec<CohortContribution>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonthlyAverage {
    pub month: NaiveDate,
    pub total: i64,
    /// Mean of all totals from the start of the range up to this month.
    pub running_average: f64,
}

// ============================================================================
// CORE DIFFERENCING
// ============================================================================

/// Items processed between two consecutive observations of one cohort.
/// A count that went up (re-ingest correction, reopened cases) contributes
/// zero, never a negative.
pub fn processed_between(prev: &Snapshot, cur: &Snapshot) -> i64 {
    (prev.remaining_count - cur.remaining_count).max(0)
}

/// Per-month processed amounts for one cohort, restricted to snapshots inside
/// `[from, to]`. The earliest in-window snapshot has no predecessor and
/// contributes nothing.
pub fn cohort_monthly_processed(
    series: &CohortSeries,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<(NaiveDate, i64)> {
    let in_window: Vec<&Snapshot> = series
        .snapshots
        .iter()
        .filter(|s| from.map_or(true, |f| s.observed_at >= f))
        .filter(|s| to.map_or(true, |t| s.observed_at <= t))
        .collect();

    in_window
        .windows(2)
        .map(|pair| (pair[1].observed_at, processed_between(pair[0], pair[1])))
        .collect()
}

/// Aggregate per-cohort processed amounts into ordered monthly totals with a
/// per-cohort breakdown. Months whose summed total is not positive carry no
/// processing signal and are excluded entirely, not reported as zero.
pub fn monthly_processed_totals(
    series: &[CohortSeries],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<MonthlyTotal> {
    let mut by_month: BTreeMap<NaiveDate, Vec<CohortContribution>> = BTreeMap::new();

    for cohort in series {
        for (month, processed) in cohort_monthly_processed(cohort, from, to) {
            if processed > 0 {
                by_month.entry(month).or_default().push(CohortContribution {
                    lodged_period: cohort.cohort.lodged_period,
                    processed,
                });
            }
        }
    }

    by_month
        .into_iter()
        .map(|(month, breakdown)| MonthlyTotal {
            month,
            total: breakdown.iter().map(|c| c.processed).sum(),
            breakdown,
        })
        .filter(|mt| mt.total > 0)
        .collect()
}

/// Cumulative mean from the start of the range, not a trailing window:
/// entry k's average covers entries 0..=k.
pub fn running_average(totals: &[MonthlyTotal]) -> Vec<MonthlyAverage> {
    let mut running_sum = 0i64;
    totals
        .iter()
        .enumerate()
        .map(|(i, mt)| {
            running_sum += mt.total;
            MonthlyAverage {
                month: mt.month,
                total: mt.total,
                running_average: running_sum as f64 / (i + 1) as f64,
            }
        })
        .collect()
}

/// Mean monthly throughput over the most recent `window` months with a
/// positive total. Fewer qualifying months than the window averages over
/// what exists; none at all yields 0.0 rather than an error.
pub fn weighted_average(totals: &[MonthlyTotal], window: usize) -> f64 {
    let recent: Vec<i64> = totals
        .iter()
        .rev()
        .filter(|mt| mt.total > 0)
        .take(window)
        .map(|mt| mt.total)
        .collect();

    if recent.is_empty() {
        return 0.0;
    }
    recent.iter().sum::<i64>() as f64 / recent.len() as f64
}

/// Total still outstanding across the entity: each cohort's most recent
/// observation, summed.
pub fn on_hand_total(series: &[CohortSeries]) -> i64 {
    series
        .iter()
        .filter_map(|c| c.latest())
        .map(|s| s.remaining_count)
        .sum()
}

// ============================================================================
// ENTITY-LEVEL SURFACE
// ============================================================================

fn normalize_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
    let from = from.map(month_floor);
    let to = to.map(month_floor);
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(EngineError::InvalidRange { from: f, to: t });
        }
    }
    Ok((from, to))
}

/// Outstanding items on hand for an entity.
pub fn on_hand(store: &impl SnapshotSource, code: &str) -> Result<i64> {
    let entity = store.entity(code)?;
    Ok(on_hand_total(&store.cohort_series(entity.id)?))
}

/// Ordered monthly processed totals for an entity, optionally ranged.
pub fn monthly_processed(
    store: &impl SnapshotSource,
    code: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<MonthlyTotal>> {
    let entity = store.entity(code)?;
    let (from, to) = normalize_range(from, to)?;
    Ok(monthly_processed_totals(&store.cohort_series(entity.id)?, from, to))
}

/// Monthly totals with the cumulative running average attached.
pub fn monthly_average(
    store: &impl SnapshotSource,
    code: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<MonthlyAverage>> {
    Ok(running_average(&monthly_processed(store, code, from, to)?))
}

/// Forecast rate: weighted average over the most recent qualifying months.
pub fn weighted_average_rate(
    store: &impl SnapshotSource,
    code: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<f64> {
    Ok(weighted_average(
        &monthly_processed(store, code, from, to)?,
        WEIGHTED_WINDOW,
    ))
}
