//! Gap detection over the header index.
//!
//! A gap is either an initial range below the first stored height, a structural
//! hole between two stored heights, or a run of stored heights whose
//! `times_validated` is still below the requested threshold.

use crate::index::db::Database;
use crate::index::error::{to_sql_int, IndexResult};
use crate::index::gaps::{compress_to_gaps, Gap};
use rusqlite::OptionalExtension;

/// Read side of the index used by the backfill scan.
pub trait Retriever: Send + Sync {
    /// Lowest stored height, `None` when nothing is indexed yet.
    fn first_height(&self) -> IndexResult<Option<u64>>;

    /// Highest stored height, `None` when nothing is indexed yet.
    fn last_height(&self) -> IndexResult<Option<u64>>;

    /// Ranges that need (re)ingestion, as a work queue.
    fn find_gaps(&self, validation_threshold: u32) -> IndexResult<Vec<Gap>>;
}

/// Validation counter of one stored header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderValidation {
    pub height: u64,
    pub block_hash: String,
    pub times_validated: i64,
}

#[derive(Debug, Clone)]
pub struct GapRetriever {
    db: Database,
}

impl GapRetriever {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Structural holes: `[h+1, h'-1]` for each stored `h` whose successor `h'` is not `h+1`.
    fn structural_holes(&self) -> IndexResult<Vec<Gap>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT block_number + 1, next_number - 1 FROM (
                 SELECT block_number,
                        LEAD(block_number) OVER (ORDER BY block_number) AS next_number
                 FROM (SELECT DISTINCT block_number FROM header_cids)
             )
             WHERE next_number IS NOT NULL AND next_number > block_number + 1
             ORDER BY block_number",
        )?;
        let holes = stmt
            .query_map([], |row| {
                Ok(Gap::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holes)
    }

    fn under_validated_heights(&self, validation_threshold: u32) -> IndexResult<Vec<u64>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT block_number FROM header_cids
             WHERE times_validated < ?1
             ORDER BY block_number",
        )?;
        let heights = stmt
            .query_map([i64::from(validation_threshold)], |row| {
                row.get::<_, i64>(0).map(|height| height as u64)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(heights)
    }

    fn boundary(&self, sql: &str) -> IndexResult<Option<u64>> {
        let conn = self.db.conn()?;
        let height: Option<i64> = conn
            .query_row(sql, [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(height.map(|h| h as u64))
    }

    /// Per-header validation counters for stored heights within `[start, stop]`.
    pub fn validation_levels(&self, start: u64, stop: u64) -> IndexResult<Vec<HeaderValidation>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT block_number, block_hash, times_validated FROM header_cids
             WHERE block_number BETWEEN ?1 AND ?2
             ORDER BY block_number, block_hash",
        )?;
        let rows = stmt
            .query_map(
                [to_sql_int("start", start)?, to_sql_int("stop", stop)?],
                |row| {
                    Ok(HeaderValidation {
                        height: row.get::<_, i64>(0)? as u64,
                        block_hash: row.get(1)?,
                        times_validated: row.get(2)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Retriever for GapRetriever {
    fn first_height(&self) -> IndexResult<Option<u64>> {
        self.boundary("SELECT MIN(block_number) FROM header_cids")
    }

    fn last_height(&self) -> IndexResult<Option<u64>> {
        self.boundary("SELECT MAX(block_number) FROM header_cids")
    }

    fn find_gaps(&self, validation_threshold: u32) -> IndexResult<Vec<Gap>> {
        let Some(first) = self.first_height()? else {
            tracing::info!("index is empty; no gaps to report");
            return Ok(Vec::new());
        };

        let mut gaps = Vec::new();
        if first > 0 {
            gaps.push(Gap::new(0, first - 1));
        }

        let holes = self.structural_holes()?;
        let under_validated = compress_to_gaps(&self.under_validated_heights(validation_threshold)?);
        if !categories_disjoint(&holes, &under_validated) {
            debug_assert!(false, "structural holes overlap under-validated ranges");
            tracing::error!(
                holes = holes.len(),
                under_validated = under_validated.len(),
                "structural holes overlap under-validated ranges"
            );
        }

        tracing::debug!(
            first,
            initial = first > 0,
            holes = holes.len(),
            under_validated = under_validated.len(),
            validation_threshold,
            "gap scan complete"
        );

        gaps.extend(holes);
        gaps.extend(under_validated);
        Ok(gaps)
    }
}

/// Both inputs are sorted ascending and internally disjoint.
fn categories_disjoint(holes: &[Gap], under_validated: &[Gap]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < holes.len() && j < under_validated.len() {
        if holes[i].overlaps(&under_validated[j]) {
            return false;
        }
        if holes[i].stop < under_validated[j].stop {
            i += 1;
        } else {
            j += 1;
        }
    }
    true
}
