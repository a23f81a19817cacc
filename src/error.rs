// Error kinds for the forecasting core.
//
// Every failure the engine can hit is representable as a structured result;
// there are no fatal errors. Aggregation functions degrade to empty/zero
// output instead of erroring, so most of these surface only at the caller
// boundary (unknown entity) or where downstream math needs a hard signal
// (no snapshots, no allocation row, zero throughput rate).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown entity code.
    #[error("no tracked entity with code '{0}'")]
    NotFound(String),

    /// Entity exists but has no usable data for the request.
    #[error("no data: {0}")]
    NoData(String),

    /// No allocation row exists for the entity in any fiscal year.
    #[error("no allocation recorded for entity '{0}' in any fiscal year")]
    NoAllocation(String),

    /// Computed throughput rate is zero, so no completion date can be derived.
    #[error("processing rate unavailable: no positive monthly throughput in the lookback window")]
    RateUnavailable,

    /// Malformed date range (from > to).
    #[error("invalid range: {from} is after {to}")]
    InvalidRange {
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl EngineError {
    /// True for the upstream failures the forecast surface collapses into a
    /// single "insufficient data" outcome (missing snapshots or allocation).
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, EngineError::NoData(_) | EngineError::NoAllocation(_))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
