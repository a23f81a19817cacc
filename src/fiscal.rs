// Fiscal Window Resolver - July-June accounting year
//
// Quota allocations run on a July 1 - June 30 fiscal year. Every
// fiscal-year-scoped query resolves its window through here, from an
// explicit reference date rather than the wall clock, so the engine stays a
// pure function of its inputs.

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// One fiscal year: 1 July of `start_year` through 30 June of the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub start_year: i32,
    /// Display label, e.g. "FY2024-25".
    pub label: String,
}

impl FiscalWindow {
    /// Resolve the fiscal window containing `reference`.
    ///
    /// July onwards belongs to the fiscal year starting that calendar year;
    /// January-June belongs to the one that started the year before.
    pub fn containing(reference: NaiveDate) -> Self {
        let start_year = if reference.month() >= 7 {
            reference.year()
        } else {
            reference.year() - 1
        };

        // Both dates are always valid: July 1 and June 30 exist in every year.
        let start = NaiveDate::from_ymd_opt(start_year, 7, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(start_year + 1, 6, 30).unwrap();

        FiscalWindow {
            start,
            end,
            start_year,
            label: format!("FY{}-{:02}", start_year, (start_year + 1) % 100),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

// ============================================================================
// MONTH HELPERS
// ============================================================================
// Cohort lodgement periods and snapshot months are stored as first-of-month
// dates; these keep that normalization in one place.

/// First day of the month containing `date`.
pub fn month_floor(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap()
}

/// `date` shifted back `n` whole months.
pub fn months_before(date: NaiveDate, n: u32) -> NaiveDate {
    date - Months::new(n)
}
