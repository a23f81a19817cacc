// Lodgetrack - Core Library
// Cohort backlog tracking and completion-date forecasting over irregular
// queue-size snapshots, scoped to July-June fiscal-year quota allocations.
// Exposes all modules for use in the CLI and tests; the analytical surface
// is pure reads over the snapshot store.

pub mod allocation;
pub mod error;
pub mod fiscal;
pub mod forecast;
pub mod queue;
pub mod store;
pub mod throughput;

// Re-export commonly used types
pub use allocation::{remaining_allocation, total_processed_this_fy, FyProcessed, RemainingAllocation};
pub use error::EngineError;
pub use fiscal::{month_floor, FiscalWindow};
pub use forecast::{
    forecast, Forecast, AVG_DAYS_PER_MONTH, MIN_MONTHLY_RATE, PREVIOUS_FY_RATE_PENALTY,
};
pub use queue::{cases_ahead, priority_ratio, CasesAhead, CohortOutstanding, PriorityRatio};
pub use store::{
    AllocationSource, AllocationYear, Cohort, CohortSeries, IngestSummary, Snapshot,
    SnapshotRecord, SnapshotSource, Store, TrackedEntity,
};
pub use throughput::{
    monthly_average, monthly_processed, on_hand, weighted_average_rate, CohortContribution,
    MonthlyAverage, MonthlyTotal, WEIGHTED_WINDOW,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
