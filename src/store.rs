// Snapshot Store + Allocation Registry - SQLite persistence
//
// Holds tracked entities, their monthly lodgement cohorts, the irregular
// time series of queue-size snapshots per cohort, and fiscal-year quota
// allocations. The analytical modules read through the `SnapshotSource` /
// `AllocationSource` traits and never write; the only writer paths are
// `ingest_batch` (applied atomically per batch), `upsert_allocation`, and
// the cascading `purge_entity`.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::fiscal::month_floor;

// ============================================================================
// ROW TYPES
// ============================================================================

/// The thing being queued, e.g. one category of application.
/// Immutable once created; removed only via `purge_entity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: i64,
    /// Human label, unique across entities.
    pub code: String,
}

/// All items lodged in the same calendar month for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub id: i64,
    pub entity_id: i64,
    /// Lodgement month, stored as the first of the month.
    pub lodged_period: NaiveDate,
    /// Count observed when the cohort was first ingested. Set once from the
    /// maximum remaining_count across the creating batch, never mutated.
    pub initial_volume: i64,
}

/// One observation of a cohort's outstanding count. Snapshots are NOT evenly
/// spaced; consumers must diff against the most recent earlier snapshot, not
/// the previous calendar month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Snapshot {
    pub observed_at: NaiveDate,
    pub remaining_count: i64,
}

/// Quota for one entity in one fiscal year. Upserted by an admin action;
/// read-only to the analytical core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationYear {
    pub entity_id: i64,
    pub fiscal_year_start: i32,
    pub allocation_amount: i64,
}

/// A cohort with its snapshot series, ordered ascending by month.
#[derive(Debug, Clone)]
pub struct CohortSeries {
    pub cohort: Cohort,
    pub snapshots: Vec<Snapshot>,
}

impl CohortSeries {
    /// Most recent observation, if any.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}

/// One validated record from the external loader:
/// which cohort, which observation month, how many still outstanding.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SnapshotRecord {
    pub lodged_period: NaiveDate,
    pub observed_at: NaiveDate,
    pub remaining_count: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestSummary {
    pub cohorts_created: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

// ============================================================================
// READ-ONLY ACCESS TRAITS
// ============================================================================
// The analytical modules take these instead of a concrete connection, so the
// engine stays a pure function of store state and its arguments.

pub trait SnapshotSource {
    /// Look up an entity by code. Unknown codes are the one caller-boundary
    /// error; everything downstream degrades to empty/zero instead.
    fn entity(&self, code: &str) -> Result<TrackedEntity>;

    /// All cohorts for an entity with their full snapshot series, cohorts
    /// ordered by lodgement month, snapshots ascending by observation month.
    fn cohort_series(&self, entity_id: i64) -> Result<Vec<CohortSeries>>;

    /// Latest observation month across every cohort of the entity.
    fn latest_observed(&self, entity_id: i64) -> Result<Option<NaiveDate>>;
}

pub trait AllocationSource {
    /// Allocation row for one fiscal year, if recorded.
    fn allocation_for(&self, entity_id: i64, fiscal_year_start: i32)
        -> Result<Option<AllocationYear>>;

    /// Most recent allocation row by fiscal year, if any exists at all.
    fn latest_allocation(&self, entity_id: i64) -> Result<Option<AllocationYear>>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.setup()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.setup()?;
        Ok(store)
    }

    fn setup(&self) -> Result<()> {
        // WAL for crash recovery; FK enforcement drives the cascade deletes.
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT UNIQUE NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS cohorts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                lodged_period TEXT NOT NULL,
                initial_volume INTEGER NOT NULL,
                UNIQUE(entity_id, lodged_period)
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cohort_id INTEGER NOT NULL REFERENCES cohorts(id) ON DELETE CASCADE,
                observed_at TEXT NOT NULL,
                remaining_count INTEGER NOT NULL CHECK (remaining_count >= 0),
                UNIQUE(cohort_id, observed_at)
            );

            CREATE TABLE IF NOT EXISTS allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                fiscal_year_start INTEGER NOT NULL,
                allocation_amount INTEGER NOT NULL,
                UNIQUE(entity_id, fiscal_year_start)
            );

            CREATE INDEX IF NOT EXISTS idx_cohorts_entity ON cohorts(entity_id, lodged_period);
            CREATE INDEX IF NOT EXISTS idx_snapshots_cohort ON snapshots(cohort_id, observed_at);
            CREATE INDEX IF NOT EXISTS idx_allocations_entity ON allocations(entity_id, fiscal_year_start);",
        )?;

        Ok(())
    }

    // ========================================================================
    // WRITER PATHS
    // ========================================================================

    /// Apply one batch of validated snapshot records for one entity,
    /// atomically. A reader never observes a partially applied batch.
    ///
    /// Cohorts are created lazily on first sight of their lodgement month;
    /// `initial_volume` is the MAX remaining_count across the whole batch for
    /// that cohort (intentionally not the chronologically first record).
    /// Re-ingested snapshots update in place when the count changed and are
    /// skipped as duplicates when it did not.
    pub fn ingest_batch(&mut self, code: &str, records: &[SnapshotRecord]) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();

        // Group by cohort month up front so the max-of-batch initial volume
        // is known before any cohort row is created.
        let mut by_cohort: BTreeMap<NaiveDate, Vec<SnapshotRecord>> = BTreeMap::new();
        for rec in records {
            by_cohort
                .entry(month_floor(rec.lodged_period))
                .or_default()
                .push(*rec);
        }

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO entities (code) VALUES (?1)",
            params![code],
        )?;
        let entity_id: i64 = tx.query_row(
            "SELECT id FROM entities WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;

        for (lodged_period, recs) in &by_cohort {
            let cohort_id = {
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM cohorts WHERE entity_id = ?1 AND lodged_period = ?2",
                        params![entity_id, sql_date(*lodged_period)],
                        |row| row.get(0),
                    )
                    .optional()?;

                match existing {
                    Some(id) => id,
                    None => {
                        let initial_volume = recs
                            .iter()
                            .map(|r| r.remaining_count)
                            .max()
                            .unwrap_or(0);
                        tx.execute(
                            "INSERT INTO cohorts (entity_id, lodged_period, initial_volume)
                             VALUES (?1, ?2, ?3)",
                            params![entity_id, sql_date(*lodged_period), initial_volume],
                        )?;
                        summary.cohorts_created += 1;
                        tx.last_insert_rowid()
                    }
                }
            };

            for rec in recs {
                let observed = month_floor(rec.observed_at);
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT remaining_count FROM snapshots
                         WHERE cohort_id = ?1 AND observed_at = ?2",
                        params![cohort_id, sql_date(observed)],
                        |row| row.get(0),
                    )
                    .optional()?;

                match existing {
                    None => {
                        tx.execute(
                            "INSERT INTO snapshots (cohort_id, observed_at, remaining_count)
                             VALUES (?1, ?2, ?3)",
                            params![cohort_id, sql_date(observed), rec.remaining_count],
                        )?;
                        summary.inserted += 1;
                    }
                    Some(count) if count != rec.remaining_count => {
                        debug!(
                            cohort = %lodged_period,
                            month = %observed,
                            old = count,
                            new = rec.remaining_count,
                            "snapshot re-ingested with changed count, updating in place"
                        );
                        tx.execute(
                            "UPDATE snapshots SET remaining_count = ?3
                             WHERE cohort_id = ?1 AND observed_at = ?2",
                            params![cohort_id, sql_date(observed), rec.remaining_count],
                        )?;
                        summary.updated += 1;
                    }
                    Some(_) => summary.skipped += 1,
                }
            }
        }

        tx.commit()?;

        info!(
            entity = code,
            cohorts_created = summary.cohorts_created,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "snapshot batch applied"
        );

        Ok(summary)
    }

    /// Record or replace the quota for one fiscal year (admin action).
    pub fn upsert_allocation(
        &self,
        code: &str,
        fiscal_year_start: i32,
        allocation_amount: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO entities (code) VALUES (?1)",
            params![code],
        )?;
        self.conn.execute(
            "INSERT INTO allocations (entity_id, fiscal_year_start, allocation_amount)
             SELECT id, ?2, ?3 FROM entities WHERE code = ?1
             ON CONFLICT(entity_id, fiscal_year_start)
             DO UPDATE SET allocation_amount = excluded.allocation_amount",
            params![code, fiscal_year_start, allocation_amount],
        )?;
        Ok(())
    }

    /// Remove an entity and everything scoped to it: cohorts, their
    /// snapshots, and allocation rows.
    pub fn purge_entity(&self, code: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM entities WHERE code = ?1", params![code])?;
        if removed == 0 {
            return Err(EngineError::NotFound(code.to_string()));
        }
        info!(entity = code, "entity purged with cohorts, snapshots, allocations");
        Ok(())
    }

    pub fn entity_codes(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT code FROM entities ORDER BY code")?;
        let codes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(codes)
    }
}

impl SnapshotSource for Store {
    fn entity(&self, code: &str) -> Result<TrackedEntity> {
        self.conn
            .query_row(
                "SELECT id, code FROM entities WHERE code = ?1",
                params![code],
                |row| {
                    Ok(TrackedEntity {
                        id: row.get(0)?,
                        code: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(code.to_string()))
    }

    fn cohort_series(&self, entity_id: i64) -> Result<Vec<CohortSeries>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.entity_id, c.lodged_period, c.initial_volume,
                    s.observed_at, s.remaining_count
             FROM cohorts c
             LEFT JOIN snapshots s ON s.cohort_id = c.id
             WHERE c.entity_id = ?1
             ORDER BY c.lodged_period, s.observed_at",
        )?;

        let rows = stmt.query_map(params![entity_id], |row| {
            let lodged: String = row.get(2)?;
            let observed: Option<String> = row.get(4)?;
            let remaining: Option<i64> = row.get(5)?;
            Ok((
                Cohort {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    lodged_period: parse_sql_date(&lodged)?,
                    initial_volume: row.get(3)?,
                },
                match observed {
                    Some(s) => Some(Snapshot {
                        observed_at: parse_sql_date(&s)?,
                        remaining_count: remaining.unwrap_or(0),
                    }),
                    None => None,
                },
            ))
        })?;

        let mut series: Vec<CohortSeries> = Vec::new();
        for row in rows {
            let (cohort, snapshot) = row?;
            match series.last_mut() {
                Some(last) if last.cohort.id == cohort.id => {
                    if let Some(snap) = snapshot {
                        last.snapshots.push(snap);
                    }
                }
                _ => series.push(CohortSeries {
                    cohort,
                    snapshots: snapshot.into_iter().collect(),
                }),
            }
        }
        Ok(series)
    }

    fn latest_observed(&self, entity_id: i64) -> Result<Option<NaiveDate>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(s.observed_at)
             FROM snapshots s
             JOIN cohorts c ON c.id = s.cohort_id
             WHERE c.entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        match latest {
            Some(s) => Ok(Some(parse_sql_date(&s)?)),
            None => Ok(None),
        }
    }
}

impl AllocationSource for Store {
    fn allocation_for(
        &self,
        entity_id: i64,
        fiscal_year_start: i32,
    ) -> Result<Option<AllocationYear>> {
        let row = self
            .conn
            .query_row(
                "SELECT entity_id, fiscal_year_start, allocation_amount
                 FROM allocations
                 WHERE entity_id = ?1 AND fiscal_year_start = ?2",
                params![entity_id, fiscal_year_start],
                map_allocation,
            )
            .optional()?;
        Ok(row)
    }

    fn latest_allocation(&self, entity_id: i64) -> Result<Option<AllocationYear>> {
        let row = self
            .conn
            .query_row(
                "SELECT entity_id, fiscal_year_start, allocation_amount
                 FROM allocations
                 WHERE entity_id = ?1
                 ORDER BY fiscal_year_start DESC
                 LIMIT 1",
                params![entity_id],
                map_allocation,
            )
            .optional()?;
        Ok(row)
    }
}

fn map_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<AllocationYear> {
    Ok(AllocationYear {
        entity_id: row.get(0)?,
        fiscal_year_start: row.get(1)?,
        allocation_amount: row.get(2)?,
    })
}

fn sql_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_sql_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn rec(lodged: NaiveDate, observed: NaiveDate, remaining: i64) -> SnapshotRecord {
        SnapshotRecord {
            lodged_period: lodged,
            observed_at: observed,
            remaining_count: remaining,
        }
    }

    #[test]
    fn test_ingest_creates_cohort_with_max_of_batch_volume() {
        let mut store = Store::open_in_memory().unwrap();

        // Out-of-order batch: the chronologically first record (80) is NOT
        // the largest; initial_volume must come from the max (120).
        let records = vec![
            rec(month(2024, 1), month(2024, 3), 80),
            rec(month(2024, 1), month(2024, 2), 120),
            rec(month(2024, 1), month(2024, 4), 60),
        ];
        let summary = store.ingest_batch("188B", &records).unwrap();
        assert_eq!(summary.cohorts_created, 1);
        assert_eq!(summary.inserted, 3);

        let entity = store.entity("188B").unwrap();
        let series = store.cohort_series(entity.id).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].cohort.initial_volume, 120);
        assert_eq!(series[0].snapshots.len(), 3);
        // Series comes back ordered by observation month.
        assert_eq!(series[0].snapshots[0].observed_at, month(2024, 2));
        assert_eq!(series[0].snapshots[2].remaining_count, 60);
    }

    #[test]
    fn test_reingest_updates_changed_skips_identical() {
        let mut store = Store::open_in_memory().unwrap();

        store
            .ingest_batch("188B", &[rec(month(2024, 1), month(2024, 2), 100)])
            .unwrap();

        // Same month, same count: duplicate. Same month, new count: update.
        let summary = store
            .ingest_batch(
                "188B",
                &[
                    rec(month(2024, 1), month(2024, 2), 100),
                    rec(month(2024, 1), month(2024, 3), 90),
                ],
            )
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.cohorts_created, 0);

        let summary = store
            .ingest_batch("188B", &[rec(month(2024, 1), month(2024, 2), 95)])
            .unwrap();
        assert_eq!(summary.updated, 1);

        let entity = store.entity("188B").unwrap();
        let series = store.cohort_series(entity.id).unwrap();
        assert_eq!(series[0].snapshots[0].remaining_count, 95);
        // initial_volume never mutates after creation.
        assert_eq!(series[0].cohort.initial_volume, 100);
    }

    #[test]
    fn test_mid_month_dates_normalize_to_first_of_month() {
        let mut store = Store::open_in_memory().unwrap();
        let lodged = NaiveDate::from_ymd_opt(2024, 1, 17).unwrap();
        let observed = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        store.ingest_batch("188B", &[rec(lodged, observed, 50)]).unwrap();

        let entity = store.entity("188B").unwrap();
        let series = store.cohort_series(entity.id).unwrap();
        assert_eq!(series[0].cohort.lodged_period, month(2024, 1));
        assert_eq!(series[0].snapshots[0].observed_at, month(2024, 2));
    }

    #[test]
    fn test_failed_batch_rolls_back_entirely() {
        let mut store = Store::open_in_memory().unwrap();

        // The second record violates the remaining_count >= 0 CHECK after
        // the first has already been written inside the transaction.
        let err = store.ingest_batch(
            "188B",
            &[
                rec(month(2024, 1), month(2024, 2), 100),
                rec(month(2024, 1), month(2024, 3), -1),
            ],
        );
        assert!(err.is_err());

        // Nothing from the batch is visible: no entity, no cohort, no
        // snapshots, including the record that inserted cleanly.
        assert!(matches!(store.entity("188B"), Err(EngineError::NotFound(_))));
        let cohorts: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM cohorts", [], |row| row.get(0))
            .unwrap();
        let snapshots: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cohorts, 0);
        assert_eq!(snapshots, 0);
    }

    #[test]
    fn test_latest_observed_spans_cohorts() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .ingest_batch(
                "188B",
                &[
                    rec(month(2024, 1), month(2024, 3), 80),
                    rec(month(2024, 2), month(2024, 5), 40),
                ],
            )
            .unwrap();
        let entity = store.entity("188B").unwrap();
        assert_eq!(store.latest_observed(entity.id).unwrap(), Some(month(2024, 5)));
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        match store.entity("NOPE") {
            Err(EngineError::NotFound(code)) => assert_eq!(code, "NOPE"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_allocation_upsert_and_latest_fallback() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_allocation("188B", 2022, 3000).unwrap();
        store.upsert_allocation("188B", 2023, 4000).unwrap();
        store.upsert_allocation("188B", 2023, 4500).unwrap(); // replace

        let entity = store.entity("188B").unwrap();
        let fy23 = store.allocation_for(entity.id, 2023).unwrap().unwrap();
        assert_eq!(fy23.allocation_amount, 4500);
        assert!(store.allocation_for(entity.id, 2024).unwrap().is_none());

        let latest = store.latest_allocation(entity.id).unwrap().unwrap();
        assert_eq!(latest.fiscal_year_start, 2023);
    }

    #[test]
    fn test_purge_cascades() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .ingest_batch("188B", &[rec(month(2024, 1), month(2024, 2), 100)])
            .unwrap();
        store.upsert_allocation("188B", 2023, 4000).unwrap();

        store.purge_entity("188B").unwrap();
        assert!(matches!(store.entity("188B"), Err(EngineError::NotFound(_))));

        let orphan_snapshots: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .unwrap();
        let orphan_allocations: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM allocations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphan_snapshots, 0);
        assert_eq!(orphan_allocations, 0);
    }
}
