//! Advisory single-row lock table, keyed by `(table, key)`.
//!
//! Locks are purely cooperative and live outside row data, so holding one
//! across store suspension points is safe. Entries are created on first use
//! and kept; the set of advisory-locked rows (changeset headers, id
//! counters, the watermark row) is small and hot.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::internal::store::{RowGuard, Table};

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<(Table, Vec<u8>), Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the advisory lock for one row, waiting if another caller
    /// holds it. The guard releases on drop.
    pub async fn lock(&self, table: Table, key: &[u8]) -> RowGuard {
        let cell = self
            .locks
            .entry((table, key.to_vec()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        cell.lock_owned().await
    }
}
