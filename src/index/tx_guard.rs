//! Scoped transaction guard used by every write path in the index.
//!
//! The guard is the only way writers touch the store: it begins an IMMEDIATE
//! transaction, hands it to a closure, and commits only when the closure returns
//! `Ok`. Any other exit (an `Err`, an early `?`, or a panic unwinding through the
//! closure) drops the transaction with [`DropBehavior::Rollback`].

use crate::index::error::IndexResult;
use rusqlite::{Connection, DropBehavior, Transaction, TransactionBehavior};

/// Runs `op` inside a transaction on `conn`, committing on success only.
pub fn atomically<T, F>(conn: &mut Connection, op: F) -> IndexResult<T>
where
    F: FnOnce(&Transaction<'_>) -> IndexResult<T>,
{
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.set_drop_behavior(DropBehavior::Rollback);

    let value = op(&tx)?;
    tx.commit()?;
    Ok(value)
}
