// Forecast Engine - when will a cohort be fully processed?
//
// The one entry point consumers call. Combines cases-ahead, remaining
// allocation, and the priority split to decide whether completion falls
// inside the current fiscal year, then converts the queue ahead into
// latest / 90th / 80th percentile completion dates at the recent processing
// rate. All rounding is upward: conservative bias toward later dates.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocation::remaining_allocation;
use crate::error::{EngineError, Result};
use crate::fiscal::FiscalWindow;
use crate::queue::{cases_ahead, priority_ratio};
use crate::store::{AllocationSource, SnapshotSource};
use crate::throughput::weighted_average_rate;

// Policy constants, preserved exactly from the operating rules they encode.
// Cases lodged before the current fiscal year are assumed to process more
// slowly going forward, since quota and attention concentrate on the current
// intake.

/// Rate multiplier applied when the lodgement predates the current FY.
pub const PREVIOUS_FY_RATE_PENALTY: f64 = 0.8;
/// Floor on the adjusted monthly rate; prevents runaway estimates when recent
/// throughput is anomalously low.
pub const MIN_MONTHLY_RATE: f64 = 100.0;
/// Average days per calendar month used to convert case counts to days.
pub const AVG_DAYS_PER_MONTH: f64 = 30.44;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Forecast {
    /// The remaining quota cannot absorb the queue ahead this fiscal year;
    /// no date math is meaningful. Terminal state.
    NextFiscalYear {
        fy_label: String,
        cases_ahead: i64,
        places_remaining: i64,
        message: String,
    },

    /// Completion falls within the current fiscal year.
    Projection {
        fy_label: String,
        /// Latest snapshot month the projection counts forward from.
        as_of: NaiveDate,
        cases_ahead: i64,
        /// Raw weighted-average monthly rate.
        monthly_rate: f64,
        /// Rate after the previous-FY penalty and the floor.
        adjusted_rate: f64,
        /// Lodged before the current fiscal year (penalty applied).
        previous_fy_lodgement: bool,
        eighty_percent_cases: i64,
        ninety_percent_cases: i64,
        eighty_percent_date: NaiveDate,
        ninety_percent_date: NaiveDate,
        latest_date: NaiveDate,
        /// Previous-FY lodgement whose 90% date is already due: predicted
        /// finished, so the case likely warrants a manual status check.
        very_overdue: bool,
    },
}

/// Days to clear `cases` at `rate` cases per month, rounded up.
fn days_to_process(cases: i64, rate: f64) -> i64 {
    ((cases as f64 / rate) * AVG_DAYS_PER_MONTH).ceil() as i64
}

/// Forecast the completion date for a case lodged on `lodgement_date`.
///
/// Upstream `NoData` / `NoAllocation` errors propagate untouched; callers
/// that want the single "insufficient data" collapse can test
/// [`EngineError::is_insufficient_data`].
pub fn forecast(
    store: &(impl SnapshotSource + AllocationSource),
    code: &str,
    lodgement_date: NaiveDate,
    today: NaiveDate,
) -> Result<Forecast> {
    let ahead = cases_ahead(store, code, lodgement_date)?;
    let alloc = remaining_allocation(store, code, today)?;
    let ratio = priority_ratio(store, code, lodgement_date, today)?;
    let fy = FiscalWindow::containing(today);

    // Share of the remaining quota expected to flow to earlier-lodged cases,
    // apportioned by this FY's observed priority split.
    let non_priority_ratio = 1.0 - ratio.priority_pct / 100.0;
    let places_remaining = (alloc.remaining as f64 * non_priority_ratio).round() as i64;

    debug!(
        entity = code,
        cases_ahead = ahead.total_ahead,
        places_remaining,
        priority_pct = ratio.priority_pct,
        "forecast inputs resolved"
    );

    if ahead.total_ahead > places_remaining {
        return Ok(Forecast::NextFiscalYear {
            message: format!(
                "{} cases ahead but only {} non-priority places left in {}; \
                 completion expected next fiscal year",
                ahead.total_ahead, places_remaining, fy.label
            ),
            fy_label: fy.label,
            cases_ahead: ahead.total_ahead,
            places_remaining,
        });
    }

    let monthly_rate = weighted_average_rate(store, code, None, None)?;
    if monthly_rate <= 0.0 {
        return Err(EngineError::RateUnavailable);
    }

    let previous_fy_lodgement = lodgement_date < fy.start;
    let penalized = if previous_fy_lodgement {
        monthly_rate * PREVIOUS_FY_RATE_PENALTY
    } else {
        monthly_rate
    };
    let adjusted_rate = penalized.max(MIN_MONTHLY_RATE);

    // Percentile case counts round up: later dates, never earlier.
    let ninety_percent_cases = (ahead.total_ahead as f64 * 0.9).ceil() as i64;
    let eighty_percent_cases = (ahead.total_ahead as f64 * 0.8).ceil() as i64;

    let latest_date = ahead.as_of + Duration::days(days_to_process(ahead.total_ahead, adjusted_rate));
    let ninety_percent_date =
        ahead.as_of + Duration::days(days_to_process(ninety_percent_cases, adjusted_rate));
    let eighty_percent_date =
        ahead.as_of + Duration::days(days_to_process(eighty_percent_cases, adjusted_rate));

    let tomorrow = today + Duration::days(1);
    let very_overdue = previous_fy_lodgement && ninety_percent_date <= tomorrow;

    Ok(Forecast::Projection {
        fy_label: fy.label,
        as_of: ahead.as_of,
        cases_ahead: ahead.total_ahead,
        monthly_rate,
        adjusted_rate,
        previous_fy_lodgement,
        eighty_percent_cases,
        ninety_percent_cases,
        eighty_percent_date,
        ninety_percent_date,
        latest_date,
        very_overdue,
    })
}
