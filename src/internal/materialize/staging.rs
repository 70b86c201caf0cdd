//! Staging queue of pending materialization work.
//!
//! Every commit inserts one entry per touched element (depth 0); the
//! materializer inserts entries for dependents owned by other shards
//! (depth > 0). Entries are keyed by typed id, so concurrent triggers for
//! the same element merge instead of queueing twice: the earliest source
//! sequence, the highest updated sequence and the smallest depth win.
//!
//! Claims are a queue-pop with a visibility timeout: a claim stamps the
//! entry with a worker token and an expiry, and an entry whose claim expired
//! is re-delivered. Acknowledging deletes the entry unless a newer trigger
//! merged in while the batch was being built, in which case the claim is
//! cleared and the entry stays queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::OsmError;
use crate::ident::TypedId;
use crate::internal::store::codec::{decode_value, encode_value, typed_id_key};
use crate::internal::store::{SequenceId, Store, StoreRead, StoreTxn, Table};

/// Process-local gauge of the staging depth, shared between the commit
/// pipeline (back-pressure) and the materializer (drain accounting). Seeded
/// from a table scan at startup and kept in step with queue writes, so the
/// hot back-pressure check never touches the store.
#[derive(Debug, Default)]
pub struct DepthGauge(std::sync::atomic::AtomicI64);

impl DepthGauge {
    pub fn set(&self, depth: usize) {
        self.0
            .store(depth as i64, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_enqueued(&self, count: usize) {
        self.0
            .fetch_add(count as i64, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_removed(&self, count: usize) {
        self.0
            .fetch_sub(count as i64, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.0.load(std::sync::atomic::Ordering::Relaxed).max(0) as usize
    }
}

/// Exclusive claim on one staging entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingClaim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// One pending recomputation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub id: TypedId,
    /// Sequence id of the earliest element-log row that triggered this entry.
    pub source_sequence: SequenceId,
    /// Highest sequence id of any trigger merged into this entry; the claim
    /// ordering key and the watermark bound.
    pub updated_sequence: SequenceId,
    /// Dependency distance from the triggering change; 0 for direct edits.
    pub depth: u32,
    pub claim: Option<StagingClaim>,
}

impl StagingEntry {
    /// An entry is claimable by `worker` when it is unclaimed, its claim
    /// expired, or the claim is the worker's own (a shard re-claiming work
    /// after a failed write transaction must not wait out its own timeout).
    fn claimable(&self, worker: Uuid, now: DateTime<Utc>) -> bool {
        match &self.claim {
            None => true,
            Some(claim) => claim.token == worker || claim.expires_at <= now,
        }
    }
}

/// Shard that owns an element. Ownership is disjoint by construction, which
/// is what upholds at-most-one concurrent materialization per element.
pub fn shard_of(id: TypedId, shard_count: usize) -> usize {
    (id.raw() % shard_count.max(1) as u64) as usize
}

/// Insert or merge a pending entry. Returns `true` when a new row was
/// created (rather than merged), so callers can keep the depth gauge exact.
pub async fn enqueue<T: StoreTxn>(
    txn: &mut T,
    id: TypedId,
    source_sequence: SequenceId,
    updated_sequence: SequenceId,
    depth: u32,
) -> Result<bool, OsmError> {
    let key = typed_id_key(id);
    let (merged, was_new) = match txn.read(Table::Staging, &key).await? {
        Some(bytes) => {
            let existing: StagingEntry = decode_value(&bytes)?;
            let merged = StagingEntry {
                id,
                source_sequence: existing.source_sequence.min(source_sequence),
                updated_sequence: existing.updated_sequence.max(updated_sequence),
                depth: existing.depth.min(depth),
                claim: existing.claim,
            };
            (merged, false)
        }
        None => (
            StagingEntry {
                id,
                source_sequence,
                updated_sequence,
                depth,
                claim: None,
            },
            true,
        ),
    };
    txn.put(Table::Staging, key, encode_value(&merged)?.into());
    Ok(was_new)
}

/// All pending entries, optionally restricted to one shard's partition.
async fn pending<R: StoreRead + ?Sized>(
    reader: &R,
    shard: Option<usize>,
    shard_count: usize,
) -> Result<Vec<StagingEntry>, OsmError> {
    let rows = reader.scan(Table::Staging, &[], &[], usize::MAX).await?;
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let entry: StagingEntry = decode_value(&row.value)?;
        if let Some(shard) = shard
            && shard_of(entry.id, shard_count) != shard
        {
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Smallest `updated_sequence` still queued (claimed or not), optionally for
/// one shard. This is the value the watermark may not pass.
pub async fn pending_floor<R: StoreRead + ?Sized>(
    reader: &R,
    shard: Option<usize>,
    shard_count: usize,
) -> Result<Option<SequenceId>, OsmError> {
    Ok(pending(reader, shard, shard_count)
        .await?
        .iter()
        .map(|entry| entry.updated_sequence)
        .min())
}

/// Number of queued entries, for the back-pressure gauge.
pub async fn depth<R: StoreRead + ?Sized>(reader: &R) -> Result<usize, OsmError> {
    Ok(reader.scan(Table::Staging, &[], &[], usize::MAX).await?.len())
}

/// Claim one batch for a shard: the claimable entries with the smallest
/// `updated_sequence` above the watermark, bounded by `batch_max` entries
/// and a `sequence_window` span. Returns the claimed entries, oldest first.
///
/// The claim is one optimistic transaction; a conflict (another writer
/// touched an entry between scan and claim) yields an empty batch and the
/// caller simply ticks again.
pub async fn claim_batch<S: Store>(
    store: &S,
    worker: Uuid,
    shard: usize,
    shard_count: usize,
    hwm: SequenceId,
    batch_max: usize,
    sequence_window: u64,
    visibility: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<StagingEntry>, OsmError> {
    let head = store.head().await?;
    let snapshot = store.snapshot(head).await?;
    let mut candidates = pending(&snapshot, Some(shard), shard_count).await?;
    candidates.retain(|entry| entry.updated_sequence > hwm && entry.claimable(worker, now));
    candidates.sort_by_key(|entry| (entry.updated_sequence, entry.id));

    let Some(first) = candidates.first() else {
        return Ok(Vec::new());
    };
    let window_end = first.updated_sequence.saturating_add(sequence_window);
    candidates.retain(|entry| entry.updated_sequence <= window_end);
    candidates.truncate(batch_max);

    let claim = StagingClaim {
        token: worker,
        expires_at: now + visibility,
    };

    let mut txn = store.begin().await?;
    let mut claimed = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let key = typed_id_key(candidate.id);
        // Re-read under the transaction: skip entries that were drained or
        // claimed since the snapshot.
        let Some(bytes) = txn.read(Table::Staging, &key).await? else {
            continue;
        };
        let mut entry: StagingEntry = decode_value(&bytes)?;
        if !entry.claimable(worker, now) {
            continue;
        }
        entry.claim = Some(claim);
        txn.put(Table::Staging, key, encode_value(&entry)?.into());
        claimed.push(entry);
    }
    if claimed.is_empty() {
        return Ok(Vec::new());
    }
    match txn.commit().await {
        Ok(_) => Ok(claimed),
        Err(crate::internal::store::StoreError::Conflict) => {
            warn!(shard, "staging claim lost a race, retrying next tick");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Acknowledge drained entries inside the caller's transaction. An entry
/// that accumulated a newer trigger while the batch ran keeps its place in
/// the queue (with the claim cleared); everything else is deleted. Returns
/// the number of rows actually removed.
pub async fn ack<T: StoreTxn>(
    txn: &mut T,
    drained: &[StagingEntry],
    token: Uuid,
) -> Result<usize, OsmError> {
    let mut removed = 0usize;
    for entry in drained {
        let key = typed_id_key(entry.id);
        let Some(bytes) = txn.read(Table::Staging, &key).await? else {
            continue;
        };
        let mut current: StagingEntry = decode_value(&bytes)?;
        if current.claim.map(|c| c.token) != Some(token) {
            // Someone else claimed after our visibility timeout; their batch
            // owns the entry now.
            continue;
        }
        if current.updated_sequence > entry.updated_sequence {
            current.claim = None;
            txn.put(Table::Staging, key, encode_value(&current)?.into());
        } else {
            txn.delete(Table::Staging, key);
            removed += 1;
        }
    }
    Ok(removed)
}
