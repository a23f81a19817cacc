// Queue Position Analyzer - who is ahead, and who is jumping the queue
//
// Two questions about a reference lodgement date:
//   1. How many outstanding cases were lodged before it ("cases ahead"),
//      measured at the entity's latest snapshot month.
//   2. Of this fiscal year's throughput, how much went to cases lodged AFTER
//      it ("priority" processing, an explicit queue-jump signal) versus to
//      earlier-lodged cases. The split apportions scarce annual quota between
//      the two populations in the forecast.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::fiscal::FiscalWindow;
use crate::store::SnapshotSource;
use crate::throughput::monthly_processed_totals;

/// One cohort's outstanding count at the as-of month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CohortOutstanding {
    pub lodged_period: NaiveDate,
    pub remaining_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasesAhead {
    pub total_ahead: i64,
    /// Latest snapshot month across the entity; the measurement point.
    pub as_of: NaiveDate,
    pub breakdown: Vec<CohortOutstanding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRatio {
    pub fy_label: String,
    /// Processed this FY from cohorts lodged after the reference date.
    pub priority_count: i64,
    /// Processed this FY from cohorts lodged on or before it.
    pub non_priority_count: i64,
    /// Percent of the bucket sum, 0-100. Never computed against allocation.
    pub priority_pct: f64,
    pub non_priority_pct: f64,
}

/// Outstanding cases lodged strictly before `lodgement_date`, counted at the
/// entity's latest snapshot month only. Cohorts without an observation at
/// that month contribute nothing.
pub fn cases_ahead(
    store: &impl SnapshotSource,
    code: &str,
    lodgement_date: NaiveDate,
) -> Result<CasesAhead> {
    let entity = store.entity(code)?;

    let as_of = store.latest_observed(entity.id)?.ok_or_else(|| {
        EngineError::NoData(format!("entity '{}' has no snapshots", code))
    })?;

    let breakdown: Vec<CohortOutstanding> = store
        .cohort_series(entity.id)?
        .iter()
        .filter(|cs| cs.cohort.lodged_period < lodgement_date)
        .filter_map(|cs| {
            cs.snapshots
                .iter()
                .find(|s| s.observed_at == as_of)
                .map(|s| CohortOutstanding {
                    lodged_period: cs.cohort.lodged_period,
                    remaining_count: s.remaining_count,
                })
        })
        .collect();

    Ok(CasesAhead {
        total_ahead: breakdown.iter().map(|c| c.remaining_count).sum(),
        as_of,
        breakdown,
    })
}

/// Split the current fiscal year's processed counts into later-lodged
/// ("priority") and earlier-lodged buckets relative to `lodgement_date`.
/// Percentages are of the bucket sum; a zero bucket sum means no FY
/// throughput signal at all and surfaces as `NoData`.
pub fn priority_ratio(
    store: &impl SnapshotSource,
    code: &str,
    lodgement_date: NaiveDate,
    today: NaiveDate,
) -> Result<PriorityRatio> {
    let entity = store.entity(code)?;
    let fy = FiscalWindow::containing(today);

    // Per-cohort breakdown is what lets each processed amount be attributed
    // to its cohort's lodgement month.
    let totals = monthly_processed_totals(
        &store.cohort_series(entity.id)?,
        Some(fy.start),
        Some(fy.end),
    );

    let mut priority_count = 0i64;
    let mut non_priority_count = 0i64;
    for monthly in &totals {
        for contribution in &monthly.breakdown {
            if contribution.lodged_period > lodgement_date {
                priority_count += contribution.processed;
            } else {
                non_priority_count += contribution.processed;
            }
        }
    }

    let bucket_sum = priority_count + non_priority_count;
    if bucket_sum == 0 {
        return Err(EngineError::NoData(format!(
            "entity '{}' has no processed cases in {}",
            code, fy.label
        )));
    }

    Ok(PriorityRatio {
        fy_label: fy.label,
        priority_count,
        non_priority_count,
        priority_pct: priority_count as f64 / bucket_sum as f64 * 100.0,
        non_priority_pct: non_priority_count as f64 / bucket_sum as f64 * 100.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SnapshotRecord, Store};

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn rec(lodged: NaiveDate, observed: NaiveDate, remaining: i64) -> SnapshotRecord {
        SnapshotRecord {
            lodged_period: lodged,
            observed_at: observed,
            remaining_count: remaining,
        }
    }

    /// Two cohorts: one lodged May 2023, one August 2024, with snapshot
    /// history spanning the 2024-25 fiscal boundary.
    fn fixture() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store
            .ingest_batch(
                "188B",
                &[
                    rec(month(2023, 5), month(2024, 6), 2000),
                    rec(month(2023, 5), month(2024, 7), 1900),
                    rec(month(2023, 5), month(2024, 8), 1700),
                    rec(month(2023, 5), month(2024, 9), 1500),
                    rec(month(2023, 5), month(2024, 10), 1200),
                    rec(month(2024, 8), month(2024, 8), 500),
                    rec(month(2024, 8), month(2024, 9), 450),
                    rec(month(2024, 8), month(2024, 10), 400),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_cases_ahead_counts_earlier_cohorts_at_latest_month() {
        let store = fixture();
        let ahead = cases_ahead(&store, "188B", d(2023, 6, 10)).unwrap();
        assert_eq!(ahead.as_of, month(2024, 10));
        assert_eq!(ahead.total_ahead, 1200);
        assert_eq!(ahead.breakdown.len(), 1);
        assert_eq!(ahead.breakdown[0].lodged_period, month(2023, 5));
    }

    #[test]
    fn test_cases_ahead_includes_all_earlier_cohorts() {
        let store = fixture();
        // Reference after both cohorts: both count.
        let ahead = cases_ahead(&store, "188B", d(2024, 9, 1)).unwrap();
        assert_eq!(ahead.total_ahead, 1600);
        assert_eq!(ahead.breakdown.len(), 2);
    }

    #[test]
    fn test_cases_ahead_no_snapshots_is_no_data() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_allocation("188B", 2024, 1000).unwrap();
        let err = cases_ahead(&store, "188B", d(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, EngineError::NoData(_)));
    }

    #[test]
    fn test_priority_ratio_splits_fy_throughput() {
        let store = fixture();
        let today = d(2024, 12, 15); // FY2024-25

        // Earlier cohort processed 700 inside the FY window (the 2024-07
        // snapshot has no in-window predecessor), later cohort 100.
        let ratio = priority_ratio(&store, "188B", d(2023, 6, 10), today).unwrap();
        assert_eq!(ratio.fy_label, "FY2024-25");
        assert_eq!(ratio.non_priority_count, 700);
        assert_eq!(ratio.priority_count, 100);
        assert_eq!(ratio.priority_pct, 12.5);
        assert_eq!(ratio.non_priority_pct, 87.5);
    }

    #[test]
    fn test_priority_ratio_zero_bucket_is_no_data() {
        let store = fixture();
        // A "today" in a fiscal year with no snapshots at all.
        let err = priority_ratio(&store, "188B", d(2023, 6, 10), d(2026, 8, 1)).unwrap_err();
        assert!(matches!(err, EngineError::NoData(_)));
    }

    #[test]
    fn test_priority_percentages_sum_to_hundred() {
        let store = fixture();
        let ratio = priority_ratio(&store, "188B", d(2023, 6, 10), d(2024, 12, 15)).unwrap();
        assert!((ratio.priority_pct + ratio.non_priority_pct - 100.0).abs() < 1e-9);
    }
}
