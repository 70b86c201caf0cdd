//! Transactional, range-scannable key/value substrate the rest of the crate
//! is written against.
//!
//! The contract is deliberately narrow: named ordered tables, optimistic
//! transactions with a monotonic commit sequence, snapshot reads pinned to a
//! sequence id, an envelope secondary index per spatial table, and advisory
//! single-row locks for serializing hot critical sections. Everything else
//! (versioning rules, staging, watermarks) is built on top by the element
//! log, commit pipeline and materializer.
//!
//! Failure model: `Conflict` for optimistic write conflicts (retry policy
//! belongs to the caller), `Unavailable` for infrastructure outages (no local
//! recovery), `Codec` for row serialization defects.

pub mod codec;
pub mod locks;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::internal::element::bounds::Bounds;

/// Global monotonic commit counter value. Unique per committed row batch,
/// contiguous within one commit.
pub type SequenceId = u64;

/// Guard for an advisory single-row lock. Dropping releases the lock.
pub type RowGuard = tokio::sync::OwnedMutexGuard<()>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another transaction committed a write to one of this transaction's
    /// keys first.
    #[error("Optimistic write conflict")]
    Conflict,

    /// The substrate is unreachable or failing; surfaced to the caller
    /// unchanged.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A row failed to encode or decode.
    #[error("Row codec failure: {0}")]
    Codec(String),
}

/// Logical tables of the persisted layout. Key shapes live in [`codec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// `(typed_id, version)` -> `ElementVersion`.
    Element,
    /// `typed_id` -> latest version number.
    ElementLatest,
    /// per-row `sequence_id` -> `(typed_id, version)`.
    ElementSequence,
    /// `(member_typed_id, parent_typed_id)` -> `()`, latest rows only.
    ElementMembers,
    /// `changeset_id` -> `Changeset`.
    Changeset,
    /// `changeset_id` -> last update time; rows exist only while open.
    ChangesetOpen,
    /// `(user_id, changeset_id)` -> `()`.
    ChangesetUser,
    /// `(changeset_id, sequence_id)` -> commit envelope. Envelope-indexed.
    ChangesetBounds,
    /// `typed_id` -> `MaterializedGeometry`. Envelope-indexed.
    Spatial,
    /// `(cell quadkey, typed_id)` -> `()`.
    SpatialCells,
    /// `typed_id` -> `StagingEntry`.
    Staging,
    /// Global and per-shard watermark rows.
    Watermark,
    /// `element kind` -> highest allocated id.
    IdCounter,
    /// Mutation batch digest -> original commit receipt.
    Fingerprint,
}

/// One scanned row.
#[derive(Clone, Debug)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Bytes,
}

/// Receipt of a committed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitToken {
    /// The commit's sequence id: the last id of its reserved range, or a
    /// fresh id when nothing was reserved.
    pub sequence: SequenceId,
}

/// Contiguous block of sequence ids reserved by one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRange {
    pub first: SequenceId,
    pub count: u64,
}

impl SequenceRange {
    pub fn last(&self) -> SequenceId {
        self.first + self.count - 1
    }

    pub fn iter(&self) -> std::ops::Range<SequenceId> {
        self.first..self.first + self.count
    }
}

/// Read surface shared by transactions and snapshots.
///
/// Transactions observe their own buffered writes overlaid on the state
/// committed before they began; snapshots observe exactly the rows committed
/// with `sequence <= at`. Envelope scans observe committed state only.
#[async_trait]
pub trait StoreRead: Send + Sync {
    async fn read(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Ascending scan over the half-open key range `[start, end)`, at most
    /// `limit` rows. An empty `end` means "to the end of the table".
    async fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, StoreError>;

    /// Keys in `table`'s envelope index whose envelope intersects `query`.
    async fn scan_envelope(
        &self,
        table: Table,
        query: &Bounds,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError>;
}

/// A read-write transaction. Writes are buffered until `commit`; dropping
/// the value rolls everything back, including reserved sequence ids.
#[async_trait]
pub trait StoreTxn: StoreRead {
    fn put(&mut self, table: Table, key: Vec<u8>, value: Bytes);

    fn delete(&mut self, table: Table, key: Vec<u8>);

    /// Insert or replace `key`'s entry in the table's envelope index.
    fn put_envelope(&mut self, table: Table, key: Vec<u8>, bounds: Bounds);

    fn delete_envelope(&mut self, table: Table, key: Vec<u8>);

    /// Reserve `count` contiguous sequence ids for rows written by this
    /// transaction. The reservation holds back the store head until the
    /// transaction commits or rolls back, so snapshots never observe a gap
    /// that could still be filled.
    async fn reserve_sequences(&mut self, count: u64) -> Result<SequenceRange, StoreError>;

    /// Atomically apply all buffered writes. Fails with `Conflict` if any
    /// written key was committed past this transaction's begin point.
    async fn commit(self) -> Result<CommitToken, StoreError>
    where
        Self: Sized;
}

/// Handle to the substrate. Cloneable and shared across components; no
/// module-level state anywhere in the crate.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Txn: StoreTxn + 'static;
    type Snapshot: StoreRead + 'static;

    async fn begin(&self) -> Result<Self::Txn, StoreError>;

    /// Read-only view of every row committed with `sequence <= at`. `at` is
    /// clamped to [`Store::head`].
    async fn snapshot(&self, at: SequenceId) -> Result<Self::Snapshot, StoreError>;

    /// Highest sequence id such that every commit at or below it is durable.
    async fn head(&self) -> Result<SequenceId, StoreError>;

    /// Advisory lock on one row. Purely cooperative: it serializes critical
    /// sections between callers that take the same lock, nothing else.
    async fn lock_row(&self, table: Table, key: &[u8]) -> Result<RowGuard, StoreError>;
}
