//! Range deletion and validation resets over the index.

use crate::index::db::Database;
use crate::index::error::{to_sql_int, IndexError, IndexResult};
use crate::index::gaps::Gap;
use crate::index::tx_guard::atomically;
use rusqlite::{params, Transaction};
use std::fmt;
use std::str::FromStr;

const TX_BLOBS_IN_RANGE: &str = "
    DELETE FROM blocks
    WHERE key IN (
        SELECT t.mh_key FROM transaction_cids t
        JOIN header_cids h ON t.header_id = h.id
        WHERE h.block_number BETWEEN ?1 AND ?2
    )
    AND NOT EXISTS (
        SELECT 1 FROM transaction_cids t
        JOIN header_cids h ON t.header_id = h.id
        WHERE t.mh_key = blocks.key AND h.block_number NOT BETWEEN ?1 AND ?2
    )";

const HEADER_BLOBS_IN_RANGE: &str = "
    DELETE FROM blocks
    WHERE key IN (SELECT mh_key FROM header_cids WHERE block_number BETWEEN ?1 AND ?2)
    AND NOT EXISTS (
        SELECT 1 FROM header_cids h
        WHERE h.mh_key = blocks.key AND h.block_number NOT BETWEEN ?1 AND ?2
    )";

const INPUTS_IN_RANGE: &str = "
    DELETE FROM tx_inputs WHERE tx_id IN (
        SELECT t.id FROM transaction_cids t
        JOIN header_cids h ON t.header_id = h.id
        WHERE h.block_number BETWEEN ?1 AND ?2
    )";

const OUTPUTS_IN_RANGE: &str = "
    DELETE FROM tx_outputs WHERE tx_id IN (
        SELECT t.id FROM transaction_cids t
        JOIN header_cids h ON t.header_id = h.id
        WHERE h.block_number BETWEEN ?1 AND ?2
    )";

const TXS_IN_RANGE: &str = "
    DELETE FROM transaction_cids WHERE header_id IN (
        SELECT id FROM header_cids WHERE block_number BETWEEN ?1 AND ?2
    )";

const HEADERS_IN_RANGE: &str = "DELETE FROM header_cids WHERE block_number BETWEEN ?1 AND ?2";

const RESET_VALIDATION: &str =
    "UPDATE header_cids SET times_validated = 0 WHERE block_number BETWEEN ?1 AND ?2";

/// Which slice of the index a clean removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataScope {
    #[default]
    Full,
    HeadersOnly,
    TransactionsOnly,
}

impl DataScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataScope::Full => "full",
            DataScope::HeadersOnly => "headers",
            DataScope::TransactionsOnly => "transactions",
        }
    }

    fn affected_tables(&self) -> &'static [&'static str] {
        match self {
            DataScope::Full | DataScope::HeadersOnly => &[
                "tx_inputs",
                "tx_outputs",
                "transaction_cids",
                "header_cids",
                "blocks",
            ],
            DataScope::TransactionsOnly => {
                &["tx_inputs", "tx_outputs", "transaction_cids", "blocks"]
            }
        }
    }
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataScope {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(DataScope::Full),
            "headers" => Ok(DataScope::HeadersOnly),
            "transactions" => Ok(DataScope::TransactionsOnly),
            other => anyhow::bail!(
                "unrecognized data scope {other:?}; expected full, headers, or transactions"
            ),
        }
    }
}

/// Deletes indexed ranges and resets their validation counters.
pub trait Cleaner: Send + Sync {
    fn clean(&self, ranges: &[Gap], scope: DataScope) -> IndexResult<()>;
    fn reset_validation(&self, ranges: &[Gap]) -> IndexResult<()>;
}

#[derive(Debug, Clone)]
pub struct IpldCleaner {
    db: Database,
}

impl IpldCleaner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Refreshes planner statistics and reclaims space. Failures are logged only.
    fn maintain(&self, scope: DataScope) {
        let conn = match self.db.conn() {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "skipping post-clean maintenance");
                return;
            }
        };

        for table in scope.affected_tables() {
            if let Err(err) = conn.execute_batch(&format!("ANALYZE {table}")) {
                tracing::warn!(table, error = %err, "analyze failed after clean");
            }
        }
        if let Err(err) = conn.execute_batch("VACUUM") {
            tracing::warn!(error = %err, "vacuum failed after clean");
        }
    }
}

fn range_params(range: &Gap) -> IndexResult<(i64, i64)> {
    if range.stop < range.start {
        return Err(IndexError::InvalidRange {
            start: range.start,
            stop: range.stop,
        });
    }
    Ok((to_sql_int("start", range.start)?, to_sql_int("stop", range.stop)?))
}

fn checked_ranges(ranges: &[Gap]) -> IndexResult<Vec<(i64, i64)>> {
    ranges.iter().map(range_params).collect()
}

fn execute_range(tx: &Transaction<'_>, sql: &str, (start, stop): (i64, i64)) -> IndexResult<usize> {
    Ok(tx.prepare_cached(sql)?.execute(params![start, stop])?)
}

impl Cleaner for IpldCleaner {
    /// Blobs still referenced by a row outside `ranges` survive. Tx-trie nodes
    /// have no owning row and are left in place by every scope.
    fn clean(&self, ranges: &[Gap], scope: DataScope) -> IndexResult<()> {
        let bounds = checked_ranges(ranges)?;
        if bounds.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.conn()?;
        let removed = atomically(&mut conn, |tx| {
            let mut removed = 0usize;
            for range in &bounds {
                removed += execute_range(tx, TX_BLOBS_IN_RANGE, *range)?;
                if scope != DataScope::TransactionsOnly {
                    removed += execute_range(tx, HEADER_BLOBS_IN_RANGE, *range)?;
                }
                removed += execute_range(tx, INPUTS_IN_RANGE, *range)?;
                removed += execute_range(tx, OUTPUTS_IN_RANGE, *range)?;
                removed += execute_range(tx, TXS_IN_RANGE, *range)?;
                if scope != DataScope::TransactionsOnly {
                    removed += execute_range(tx, HEADERS_IN_RANGE, *range)?;
                }
            }
            Ok(removed)
        })?;
        drop(conn);

        tracing::info!(
            ranges = ranges.len(),
            scope = %scope,
            removed,
            "cleaned index ranges"
        );
        self.maintain(scope);
        Ok(())
    }

    fn reset_validation(&self, ranges: &[Gap]) -> IndexResult<()> {
        let bounds = checked_ranges(ranges)?;
        if bounds.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.conn()?;
        let reset = atomically(&mut conn, |tx| {
            let mut reset = 0usize;
            for range in &bounds {
                reset += execute_range(tx, RESET_VALIDATION, *range)?;
            }
            Ok(reset)
        })?;

        tracing::info!(ranges = ranges.len(), headers = reset, "reset validation levels");
        Ok(())
    }
}
