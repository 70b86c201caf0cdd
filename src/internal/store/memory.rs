//! In-memory reference implementation of the [`Store`] contract.
//!
//! Rows live in per-table ordered maps of version chains; each committed
//! version carries the commit's sequence id, so snapshot reads are a cutoff
//! filter over the chain. Write transactions buffer their effects and apply
//! them atomically under the table lock with first-committer-wins conflict
//! detection. Sequence ids are reserved up front and held in an in-flight
//! set: the store head only advances past a reservation once its transaction
//! commits or rolls back, which is what makes `snapshot(at <= head)` torn-
//! state free.
//!
//! Envelope indexes keep every entry generation with a `[begin, end)`
//! sequence interval, so envelope queries can be answered at any snapshot
//! cutoff. Dead generations are retained; this backend favors correctness
//! and debuggability over reclamation.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use rstar::{AABB, RTree, RTreeObject};

use crate::internal::element::bounds::Bounds;
use crate::internal::store::locks::LockTable;
use crate::internal::store::{
    CommitToken, Row, RowGuard, SequenceId, SequenceRange, Store, StoreError, StoreRead, StoreTxn,
    Table,
};

/// One committed version of one row. `value = None` is a tombstone.
#[derive(Clone, Debug)]
struct RowVersion {
    begin: SequenceId,
    /// Apply-order stamp, used only for conflict detection. Within one key's
    /// chain apply order and sequence order agree.
    applied: u64,
    value: Option<Bytes>,
}

/// One generation of an envelope-index entry, valid over `[begin, end)`.
#[derive(Clone, Debug, PartialEq)]
struct EnvelopeEntry {
    key: Vec<u8>,
    aabb: AABB<[f64; 2]>,
    begin: SequenceId,
    end: SequenceId,
}

impl RTreeObject for EnvelopeEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

#[derive(Default)]
struct EnvelopeIndex {
    tree: RTree<EnvelopeEntry>,
    /// Open generation per key: `(aabb, begin)`.
    live: AHashMap<Vec<u8>, (AABB<[f64; 2]>, SequenceId)>,
}

impl EnvelopeIndex {
    fn close_open_entry(&mut self, key: &[u8], at: SequenceId) {
        if let Some((aabb, begin)) = self.live.remove(key) {
            let open = EnvelopeEntry {
                key: key.to_vec(),
                aabb,
                begin,
                end: SequenceId::MAX,
            };
            if let Some(mut closed) = self.tree.remove(&open) {
                closed.end = at;
                // A generation emptied in the same commit that opened it
                // never becomes visible; drop it instead of keeping a
                // zero-width interval.
                if closed.begin < closed.end {
                    self.tree.insert(closed);
                }
            }
        }
    }

    fn put(&mut self, key: Vec<u8>, bounds: &Bounds, at: SequenceId) {
        self.close_open_entry(&key, at);
        let aabb = bounds.to_aabb();
        self.tree.insert(EnvelopeEntry {
            key: key.clone(),
            aabb,
            begin: at,
            end: SequenceId::MAX,
        });
        self.live.insert(key, (aabb, at));
    }

    fn delete(&mut self, key: &[u8], at: SequenceId) {
        self.close_open_entry(key, at);
    }

    fn query(&self, query: &Bounds, at: SequenceId, limit: usize) -> Vec<Vec<u8>> {
        let aabb = query.to_aabb();
        let mut keys: Vec<Vec<u8>> = self
            .tree
            .locate_in_envelope_intersecting(&aabb)
            // Open generations (`end == MAX`) are visible at every cutoff
            // from their begin onward, including a `MAX` current-state read.
            .filter(|entry| {
                entry.begin <= at && (at < entry.end || entry.end == SequenceId::MAX)
            })
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        keys
    }
}

#[derive(Default)]
struct TableState {
    rows: AHashMap<Table, BTreeMap<Vec<u8>, Vec<RowVersion>>>,
    envelopes: AHashMap<Table, EnvelopeIndex>,
    apply_counter: u64,
}

struct SequenceState {
    next: SequenceId,
    /// First sequence id of every uncommitted reservation.
    in_flight: BTreeSet<SequenceId>,
}

impl SequenceState {
    fn reserve(&mut self, count: u64) -> SequenceRange {
        let range = SequenceRange {
            first: self.next,
            count,
        };
        self.next += count;
        self.in_flight.insert(range.first);
        range
    }

    fn release(&mut self, range: &SequenceRange) {
        self.in_flight.remove(&range.first);
    }

    /// Highest sequence id with no reservation at or below it still open.
    fn committed_head(&self) -> SequenceId {
        match self.in_flight.first() {
            Some(first) => first - 1,
            None => self.next - 1,
        }
    }
}

struct Inner {
    tables: RwLock<TableState>,
    sequence: Mutex<SequenceState>,
    locks: LockTable,
}

/// Shared in-memory store handle.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(TableState::default()),
                sequence: Mutex::new(SequenceState {
                    next: 1,
                    in_flight: BTreeSet::new(),
                }),
                locks: LockTable::new(),
            }),
        }
    }
}

/// Resolve a version chain at a cutoff: the newest version with
/// `begin <= at`, if it is not a tombstone.
fn resolve(chain: &[RowVersion], at: SequenceId) -> Option<Bytes> {
    chain
        .iter()
        .rev()
        .find(|version| version.begin <= at)
        .and_then(|version| version.value.clone())
}

fn scan_committed(
    state: &TableState,
    table: Table,
    start: &[u8],
    end: &[u8],
    at: SequenceId,
) -> Vec<Row> {
    let Some(rows) = state.rows.get(&table) else {
        return Vec::new();
    };
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    rows.range((Bound::Included(start.to_vec()), upper))
        .filter_map(|(key, chain)| {
            resolve(chain, at).map(|value| Row {
                key: key.clone(),
                value,
            })
        })
        .collect()
}

enum EnvelopeOp {
    Put(Vec<u8>, Bounds),
    Delete(Vec<u8>),
}

/// A buffered read-write transaction against [`MemStore`].
pub struct MemTxn {
    inner: Arc<Inner>,
    begin_applied: u64,
    writes: BTreeMap<(Table, Vec<u8>), Option<Bytes>>,
    envelope_ops: Vec<(Table, EnvelopeOp)>,
    reserved: Option<SequenceRange>,
    committed: bool,
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if !self.committed
            && let Some(range) = self.reserved.take()
        {
            // Roll back the reservation so the store head can move again.
            self.inner
                .sequence
                .lock()
                .expect("sequence lock poisoned")
                .release(&range);
        }
    }
}

#[async_trait]
impl StoreRead for MemTxn {
    async fn read(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        if let Some(buffered) = self.writes.get(&(table, key.to_vec())) {
            return Ok(buffered.clone());
        }
        let state = self.inner.tables.read().expect("table lock poisoned");
        Ok(state
            .rows
            .get(&table)
            .and_then(|rows| rows.get(key))
            .and_then(|chain| resolve(chain, SequenceId::MAX)))
    }

    async fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Bytes> = {
            let state = self.inner.tables.read().expect("table lock poisoned");
            scan_committed(&state, table, start, end, SequenceId::MAX)
                .into_iter()
                .map(|row| (row.key, row.value))
                .collect()
        };
        for ((t, key), value) in &self.writes {
            if *t != table || key.as_slice() < start {
                continue;
            }
            if !end.is_empty() && key.as_slice() >= end {
                continue;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged
            .into_iter()
            .take(limit)
            .map(|(key, value)| Row { key, value })
            .collect())
    }

    async fn scan_envelope(
        &self,
        table: Table,
        query: &Bounds,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.inner.tables.read().expect("table lock poisoned");
        Ok(state
            .envelopes
            .get(&table)
            .map(|index| index.query(query, SequenceId::MAX, limit))
            .unwrap_or_default())
    }
}

#[async_trait]
impl StoreTxn for MemTxn {
    fn put(&mut self, table: Table, key: Vec<u8>, value: Bytes) {
        self.writes.insert((table, key), Some(value));
    }

    fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.writes.insert((table, key), None);
    }

    fn put_envelope(&mut self, table: Table, key: Vec<u8>, bounds: Bounds) {
        self.envelope_ops.push((table, EnvelopeOp::Put(key, bounds)));
    }

    fn delete_envelope(&mut self, table: Table, key: Vec<u8>) {
        self.envelope_ops.push((table, EnvelopeOp::Delete(key)));
    }

    async fn reserve_sequences(&mut self, count: u64) -> Result<SequenceRange, StoreError> {
        if let Some(range) = self.reserved {
            return Ok(range);
        }
        let range = self
            .inner
            .sequence
            .lock()
            .expect("sequence lock poisoned")
            .reserve(count.max(1));
        self.reserved = Some(range);
        Ok(range)
    }

    async fn commit(mut self) -> Result<CommitToken, StoreError> {
        let range = match self.reserved {
            Some(range) => range,
            None => {
                let range = self
                    .inner
                    .sequence
                    .lock()
                    .expect("sequence lock poisoned")
                    .reserve(1);
                self.reserved = Some(range);
                range
            }
        };
        let sequence = range.last();

        {
            let mut state = self.inner.tables.write().expect("table lock poisoned");

            // First committer wins: any key written here that another
            // transaction committed after we began is a conflict.
            for (table, key) in self.writes.keys() {
                let newest = state
                    .rows
                    .get(table)
                    .and_then(|rows| rows.get(key))
                    .and_then(|chain| chain.last());
                if let Some(version) = newest
                    && version.applied > self.begin_applied
                {
                    return Err(StoreError::Conflict);
                }
            }

            state.apply_counter += 1;
            let applied = state.apply_counter;
            for ((table, key), value) in std::mem::take(&mut self.writes) {
                state
                    .rows
                    .entry(table)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .push(RowVersion {
                        begin: sequence,
                        applied,
                        value,
                    });
            }
            for (table, op) in self.envelope_ops.drain(..) {
                let index = state.envelopes.entry(table).or_default();
                match op {
                    EnvelopeOp::Put(key, bounds) => index.put(key, &bounds, sequence),
                    EnvelopeOp::Delete(key) => index.delete(&key, sequence),
                }
            }
        }

        self.committed = true;
        self.inner
            .sequence
            .lock()
            .expect("sequence lock poisoned")
            .release(&range);
        Ok(CommitToken { sequence })
    }
}

/// Read-only view of everything committed with `sequence <= at`.
pub struct MemSnapshot {
    inner: Arc<Inner>,
    at: SequenceId,
}

#[async_trait]
impl StoreRead for MemSnapshot {
    async fn read(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let state = self.inner.tables.read().expect("table lock poisoned");
        Ok(state
            .rows
            .get(&table)
            .and_then(|rows| rows.get(key))
            .and_then(|chain| resolve(chain, self.at)))
    }

    async fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.inner.tables.read().expect("table lock poisoned");
        let mut rows = scan_committed(&state, table, start, end, self.at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn scan_envelope(
        &self,
        table: Table,
        query: &Bounds,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.inner.tables.read().expect("table lock poisoned");
        Ok(state
            .envelopes
            .get(&table)
            .map(|index| index.query(query, self.at, limit))
            .unwrap_or_default())
    }
}

#[async_trait]
impl Store for MemStore {
    type Txn = MemTxn;
    type Snapshot = MemSnapshot;

    async fn begin(&self) -> Result<MemTxn, StoreError> {
        let begin_applied = self
            .inner
            .tables
            .read()
            .expect("table lock poisoned")
            .apply_counter;
        Ok(MemTxn {
            inner: self.inner.clone(),
            begin_applied,
            writes: BTreeMap::new(),
            envelope_ops: Vec::new(),
            reserved: None,
            committed: false,
        })
    }

    async fn snapshot(&self, at: SequenceId) -> Result<MemSnapshot, StoreError> {
        let head = self.head().await?;
        Ok(MemSnapshot {
            inner: self.inner.clone(),
            at: at.min(head),
        })
    }

    async fn head(&self) -> Result<SequenceId, StoreError> {
        Ok(self
            .inner
            .sequence
            .lock()
            .expect("sequence lock poisoned")
            .committed_head())
    }

    async fn lock_row(&self, table: Table, key: &[u8]) -> Result<RowGuard, StoreError> {
        Ok(self.inner.locks.lock(table, key).await)
    }
}
