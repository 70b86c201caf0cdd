//! The spatial watermark: the single cross-component synchronization signal
//! readers see.
//!
//! Each shard keeps a local watermark row: the highest sequence id such that
//! no staging entry the shard owns at or below it is still queued. The
//! global watermark row carries two values:
//!
//! - `hwm`: the minimum over all shard locals, additionally held back by any
//!   entry visible in the staging table. Every element-log row at or below
//!   it has been considered for materialization.
//! - `cutoff`: the store sequence of the transaction that wrote the row.
//!   Materializer transactions commit *after* the log rows they consume, so
//!   a reader wanting the geometry state "as of `hwm`" must snapshot at
//!   `cutoff`, not at `hwm` itself.
//!
//! Callers mutate watermark rows inside the same transaction that
//! acknowledges drained staging entries, under the watermark advisory lock,
//! so no interleaving can advance the global value past undrained work.
//! Both values are monotonic.

use serde::{Deserialize, Serialize};

use crate::errors::OsmError;
use crate::internal::materialize::staging;
use crate::internal::store::codec::{decode_value, encode_value, shard_watermark_key, watermark_key};
use crate::internal::store::{SequenceId, StoreRead, StoreTxn, Table};

/// Contents of the global watermark row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRow {
    /// Greatest element-log sequence known fully materialized.
    pub hwm: SequenceId,
    /// Store snapshot cutoff at which the materialized state for `hwm` is
    /// visible. Always `>= hwm`.
    pub cutoff: SequenceId,
}

/// Outcome of one watermark advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatermarkAdvance {
    pub local: SequenceId,
    pub global: WatermarkRow,
}

/// Current global watermark row; zeros before the first advance.
pub async fn read_global<R: StoreRead + ?Sized>(reader: &R) -> Result<WatermarkRow, OsmError> {
    match reader.read(Table::Watermark, &watermark_key()).await? {
        Some(bytes) => Ok(decode_value(&bytes)?),
        None => Ok(WatermarkRow::default()),
    }
}

/// One shard's local watermark, if it has reported yet.
pub async fn read_shard<R: StoreRead + ?Sized>(
    reader: &R,
    shard: usize,
) -> Result<Option<SequenceId>, OsmError> {
    match reader.read(Table::Watermark, &shard_watermark_key(shard)).await? {
        Some(bytes) => Ok(Some(decode_value(&bytes)?)),
        None => Ok(None),
    }
}

/// Advance one shard's local watermark to at most `ceiling`, then recompute
/// the global watermark. Must run inside the transaction that acknowledged
/// the drained entries (and inserted any cross-shard re-stages), with the
/// watermark advisory lock held.
///
/// `ceiling` is the highest `updated_sequence` of the drained batch, or the
/// store head for an idle refresh. A shard that cannot advance keeps its
/// previous value.
pub async fn advance<T: StoreTxn>(
    txn: &mut T,
    shard: usize,
    shard_count: usize,
    ceiling: SequenceId,
) -> Result<WatermarkAdvance, OsmError> {
    let old = read_global(txn).await?;

    // Local: bounded by this shard's oldest still-queued entry.
    let own_floor = staging::pending_floor(txn, Some(shard), shard_count).await?;
    let local_candidate = match own_floor {
        Some(floor) => ceiling.min(floor.saturating_sub(1)),
        None => ceiling,
    };
    let local = read_shard(txn, shard)
        .await?
        .unwrap_or(old.hwm)
        .max(local_candidate);
    txn.put(
        Table::Watermark,
        shard_watermark_key(shard),
        encode_value(&local)?.into(),
    );

    // Global: every shard must have reported at least this far, and nothing
    // queued anywhere (including entries staged by this very transaction)
    // may be passed.
    let mut candidate = local;
    for other in 0..shard_count {
        if other == shard {
            continue;
        }
        candidate = candidate.min(read_shard(txn, other).await?.unwrap_or(old.hwm));
    }
    if let Some(floor) = staging::pending_floor(txn, None, shard_count).await? {
        candidate = candidate.min(floor.saturating_sub(1));
    }

    // The cutoff is this transaction's own commit sequence, reserved here so
    // it can be persisted inside the row it stamps.
    let cutoff = txn.reserve_sequences(1).await?.last().max(old.cutoff);
    let global = WatermarkRow {
        hwm: old.hwm.max(candidate),
        cutoff,
    };
    txn.put(Table::Watermark, watermark_key(), encode_value(&global)?.into());

    Ok(WatermarkAdvance { local, global })
}
