//! The spatial materializer: keeps the materialized geometry table and the
//! spatial watermark consistent with the element log.
//!
//! # One tick of a shard worker
//!
//! ```text
//!  ①  read the global watermark
//!       │
//!       ▼
//!  ②  claim a staging batch            ← smallest updated_sequence first,
//!       │                                 bounded by count and window,
//!       │                                 visibility-timeout queue pop
//!       ▼
//!  ③  expand with dependents           ← ways over nodes, relations over
//!       │                                 ways/relations, cycle-bounded
//!       ▼
//!  ④  rebuild geometries               ← (depth, typed id) order, from the
//!       │                                 latest log rows and the batch's
//!       │                                 read snapshot
//!       ▼
//!  ⑤  one transaction:
//!       ├─ spatial upserts/deletes + envelope + cell index
//!       ├─ re-stage dependents owned by other shards
//!       ├─ acknowledge drained entries
//!       └─ advance local + global watermark
//! ```
//!
//! Shards own disjoint slices of the typed-id space and are single-threaded
//! inside, so at most one materialization per element runs at any time
//! without cross-shard locking. A crash between claim and commit leaves the
//! claim to expire and the entries re-delivered; because step ⑤ is a single
//! transaction, no partial watermark advance can ever be observed.

pub mod resolver;
pub mod staging;
pub mod watermark;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CoreConfig, ReferencePolicy, RelationGeometry};
use crate::errors::OsmError;
use crate::ident::{ElementKind, TypedId};
use crate::internal::element::bounds::{Bounds, Coord};
use crate::internal::element::body::Body;
use crate::internal::element::geometry::{Geometry, MaterializedGeometry};
use crate::internal::log::ElementLog;
use crate::internal::materialize::resolver::DependencyResolver;
use crate::internal::materialize::staging::{DepthGauge, StagingEntry};
use crate::internal::store::codec::{cell_key, decode_value, encode_value, typed_id_key, watermark_key};
use crate::internal::store::{SequenceId, Store, StoreError, StoreRead, StoreTxn, Table};

/// Monotonic counters describing the materializer's work so far.
#[derive(Debug, Default)]
pub struct MaterializerStats {
    batches: AtomicU64,
    drained: AtomicU64,
    rebuilt: AtomicU64,
    deleted: AtomicU64,
    unresolvable: AtomicU64,
    restaged: AtomicU64,
}

/// Point-in-time copy of [`MaterializerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializerReport {
    pub batches: u64,
    pub drained: u64,
    pub rebuilt: u64,
    pub deleted: u64,
    pub unresolvable: u64,
    pub restaged: u64,
}

impl MaterializerStats {
    pub fn report(&self) -> MaterializerReport {
        MaterializerReport {
            batches: self.batches.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            rebuilt: self.rebuilt.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            unresolvable: self.unresolvable.load(Ordering::Relaxed),
            restaged: self.restaged.load(Ordering::Relaxed),
        }
    }
}

pub struct SpatialMaterializer<S: Store> {
    store: S,
    config: Arc<CoreConfig>,
    depth: Arc<DepthGauge>,
    stats: Arc<MaterializerStats>,
}

impl<S: Store> SpatialMaterializer<S> {
    pub fn new(
        store: S,
        config: Arc<CoreConfig>,
        depth: Arc<DepthGauge>,
        stats: Arc<MaterializerStats>,
    ) -> Self {
        Self {
            store,
            config,
            depth,
            stats,
        }
    }

    /// Seed the staging depth gauge from the persisted queue, for restarts.
    pub async fn init(&self) -> Result<(), OsmError> {
        let head = self.store.head().await?;
        let snapshot = self.store.snapshot(head).await?;
        let depth = staging::depth(&snapshot).await?;
        self.depth.set(depth);
        debug!(depth, "seeded staging depth gauge");
        Ok(())
    }

    /// Build the worker owning one shard.
    pub fn worker(&self, shard: usize) -> ShardWorker<S> {
        ShardWorker {
            store: self.store.clone(),
            config: self.config.clone(),
            depth: self.depth.clone(),
            stats: self.stats.clone(),
            shard,
            shard_count: self.config.shard_count(),
            worker: Uuid::new_v4(),
            cache: LruCache::new(
                NonZeroUsize::new(self.config.geometry_cache_entries.max(1))
                    .expect("cache size is non-zero"),
            ),
        }
    }

    /// Spawn every shard worker onto the current runtime.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.shard_count())
            .map(|shard| {
                let worker = self.worker(shard);
                let cancel = cancel.clone();
                tokio::spawn(worker.run(cancel))
            })
            .collect()
    }

    pub fn stats(&self) -> MaterializerReport {
        self.stats.report()
    }
}

/// Outcome of building one element's geometry.
enum Build {
    /// Upsert this row.
    Row(MaterializedGeometry),
    /// The element is deleted or unresolvable; no row may remain.
    Absent,
}

/// Single-threaded worker that owns one shard of the typed-id space.
pub struct ShardWorker<S: Store> {
    store: S,
    config: Arc<CoreConfig>,
    depth: Arc<DepthGauge>,
    stats: Arc<MaterializerStats>,
    shard: usize,
    shard_count: usize,
    worker: Uuid,
    /// Rows this shard materialized earlier; the shard is their only writer,
    /// so entries stay valid until the shard itself replaces them. Foreign
    /// elements are always read from the batch snapshot instead.
    cache: LruCache<TypedId, MaterializedGeometry>,
}

impl<S: Store> ShardWorker<S> {
    /// Drive the shard until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(shard = self.shard, "materializer shard started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(0) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                    }
                }
                Ok(_) => {}
                Err(OsmError::Store(StoreError::Conflict)) => {
                    // The claim is still ours; retry immediately.
                    debug!(shard = self.shard, "materializer write conflicted, retrying");
                }
                Err(e) => {
                    warn!(shard = self.shard, error = %e, "materializer tick failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!(shard = self.shard, "materializer shard stopped");
    }

    /// One loop iteration: claim, rebuild, commit, advance. Returns how many
    /// staging entries were drained; zero means the queue was idle.
    pub async fn tick(&mut self) -> Result<usize, OsmError> {
        let now = Utc::now();
        let head = self.store.head().await?;
        let hwm = {
            let snapshot = self.store.snapshot(head).await?;
            watermark::read_global(&snapshot).await?.hwm
        };

        let claimed = staging::claim_batch(
            &self.store,
            self.worker,
            self.shard,
            self.shard_count,
            hwm,
            self.config.batch_max,
            self.config.batch_sequence_window,
            self.config.visibility_timeout(),
            now,
        )
        .await?;
        if claimed.is_empty() {
            self.idle_refresh(head).await?;
            return Ok(0);
        }

        let batch_high = claimed
            .iter()
            .map(|entry| entry.updated_sequence)
            .max()
            .expect("claimed batch is non-empty");
        let source_low = claimed
            .iter()
            .map(|entry| entry.source_sequence)
            .min()
            .expect("claimed batch is non-empty");

        // The batch's read snapshot: everything durable at claim time.
        let snapshot_at = self.store.head().await?;
        let snapshot = self.store.snapshot(snapshot_at).await?;

        let expansion = DependencyResolver::dependents(
            &snapshot,
            claimed.iter().map(|entry| entry.id),
            self.config.relation_max_depth,
        )
        .await?;

        // Stable build order, with dependents owned by other shards split
        // off for re-staging.
        let mut work: Vec<(TypedId, u32)> =
            expansion.iter().map(|(id, depth)| (*id, *depth)).collect();
        work.sort_by_key(|(id, depth)| (*depth, *id));
        let (own, foreign): (Vec<_>, Vec<_>) = work
            .into_iter()
            .partition(|(id, _)| staging::shard_of(*id, self.shard_count) == self.shard);

        let mut results: AHashMap<TypedId, Option<MaterializedGeometry>> = AHashMap::new();
        let mut order: Vec<TypedId> = Vec::with_capacity(own.len());
        for (id, _) in &own {
            let built = self.build_one(&snapshot, &results, *id).await?;
            let row = match built {
                Build::Row(row) => Some(row),
                Build::Absent => None,
            };
            results.insert(*id, row);
            order.push(*id);
        }

        self.commit_batch(
            &snapshot,
            &claimed,
            &order,
            &results,
            &foreign,
            source_low,
            batch_high,
        )
        .await
    }

    /// Step ⑤: everything durable happens here, in one transaction, under
    /// the watermark advisory lock.
    #[allow(clippy::too_many_arguments)]
    async fn commit_batch(
        &mut self,
        snapshot: &S::Snapshot,
        claimed: &[StagingEntry],
        order: &[TypedId],
        results: &AHashMap<TypedId, Option<MaterializedGeometry>>,
        foreign: &[(TypedId, u32)],
        source_low: SequenceId,
        batch_high: SequenceId,
    ) -> Result<usize, OsmError> {
        let _guard = self
            .store
            .lock_row(Table::Watermark, &watermark_key())
            .await?;
        let mut txn = self.store.begin().await?;

        let mut rebuilt = 0u64;
        let mut deleted = 0u64;
        let mut changed: Vec<TypedId> = Vec::new();
        for id in order {
            let result = results.get(id).expect("every ordered id has a result");
            if self.write_row(&mut txn, *id, result).await? {
                changed.push(*id);
            }
            match result {
                Some(_) => rebuilt += 1,
                None => deleted += 1,
            }
        }

        // Dependents owned by other shards inherit the batch's trigger
        // window and stay pending, holding the watermark back until their
        // own shard drains them.
        let mut restaged = 0usize;
        let mut enqueued_new = 0usize;
        for (id, depth) in foreign {
            if staging::enqueue(&mut txn, *id, source_low, batch_high, *depth).await? {
                enqueued_new += 1;
            }
            restaged += 1;
        }

        // A dependent built before its child changed in the same batch went
        // out with stale inputs; queue it for the next tick.
        let position: AHashMap<TypedId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for id in &changed {
            for parent in ElementLog::parents_of(snapshot, *id, usize::MAX).await? {
                if let (Some(parent_at), Some(child_at)) =
                    (position.get(&parent), position.get(id))
                    && parent_at < child_at
                {
                    if staging::enqueue(&mut txn, parent, source_low, batch_high, 1).await? {
                        enqueued_new += 1;
                    }
                    restaged += 1;
                }
            }
        }

        let removed = staging::ack(&mut txn, claimed, self.worker).await?;
        let advance =
            watermark::advance(&mut txn, self.shard, self.shard_count, batch_high).await?;

        txn.commit().await?;

        // Cache only after the transaction is durable.
        for id in order {
            match results.get(id).and_then(|r| r.as_ref()) {
                Some(row) => {
                    self.cache.put(*id, row.clone());
                }
                None => {
                    self.cache.pop(id);
                }
            }
        }

        self.depth.record_removed(removed);
        self.depth.record_enqueued(enqueued_new);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .drained
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);
        self.stats.rebuilt.fetch_add(rebuilt, Ordering::Relaxed);
        self.stats.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.stats
            .restaged
            .fetch_add(restaged as u64, Ordering::Relaxed);
        info!(
            shard = self.shard,
            drained = claimed.len(),
            rebuilt,
            deleted,
            restaged,
            watermark = advance.global.hwm,
            "materializer batch committed"
        );
        Ok(claimed.len())
    }

    /// Refresh the shard's local watermark when its queue is empty, so idle
    /// shards do not hold the global watermark back while other shards make
    /// progress. Skipped unless an element-log row landed past the local
    /// value; watermark bookkeeping alone must not trigger further refreshes.
    async fn idle_refresh(&self, head: SequenceId) -> Result<(), OsmError> {
        if head == 0 {
            return Ok(());
        }
        {
            let snapshot = self.store.snapshot(head).await?;
            let local = watermark::read_shard(&snapshot, self.shard)
                .await?
                .unwrap_or(0);
            if local >= head {
                return Ok(());
            }
            let newer = snapshot
                .scan(
                    Table::ElementSequence,
                    &crate::internal::store::codec::sequence_key(local + 1),
                    &[],
                    1,
                )
                .await?;
            if newer.is_empty() {
                return Ok(());
            }
        }
        let _guard = self
            .store
            .lock_row(Table::Watermark, &watermark_key())
            .await?;
        let mut txn = self.store.begin().await?;
        watermark::advance(&mut txn, self.shard, self.shard_count, head).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Compute one element's geometry from its latest log row and the
    /// batch's read snapshot.
    async fn build_one(
        &mut self,
        snapshot: &S::Snapshot,
        results: &AHashMap<TypedId, Option<MaterializedGeometry>>,
        id: TypedId,
    ) -> Result<Build, OsmError> {
        let Some(latest) = ElementLog::get_latest(snapshot, id).await? else {
            return Ok(Build::Absent);
        };
        if !latest.visible {
            return Ok(Build::Absent);
        }
        let Some(body) = &latest.body else {
            return Ok(Build::Absent);
        };

        let strict = self.config.reference_policy == ReferencePolicy::Strict;
        match body {
            Body::Node { lon, lat } => Ok(Build::Row(MaterializedGeometry::new(
                id,
                latest.sequence,
                Geometry::Point(Coord::new(*lon, *lat)),
                Vec::new(),
            ))),
            Body::Way { refs } => {
                let mut points = Vec::with_capacity(refs.len());
                let mut gaps = Vec::new();
                let mut sequence = latest.sequence;
                for reference in refs {
                    match self.resolve(snapshot, results, *reference).await? {
                        Some(row) => {
                            sequence = sequence.max(row.sequence);
                            match row.geom {
                                Geometry::Point(c) => points.push(c),
                                _ => gaps.push(*reference),
                            }
                        }
                        None => gaps.push(*reference),
                    }
                }
                if strict && !gaps.is_empty() {
                    self.stats.unresolvable.fetch_add(1, Ordering::Relaxed);
                    warn!(%id, missing = gaps.len(), "way unresolvable under strict policy");
                    return Ok(Build::Absent);
                }
                match Geometry::from_points(points) {
                    Some(geom) => Ok(Build::Row(MaterializedGeometry::new(id, sequence, geom, gaps))),
                    None => {
                        self.stats.unresolvable.fetch_add(1, Ordering::Relaxed);
                        Ok(Build::Absent)
                    }
                }
            }
            Body::Relation { members } => {
                let mut parts = Vec::with_capacity(members.len());
                let mut gaps = Vec::new();
                let mut sequence = latest.sequence;
                for member in members {
                    match self.resolve(snapshot, results, member.member).await? {
                        Some(row) => {
                            sequence = sequence.max(row.sequence);
                            parts.push(row.geom);
                        }
                        None => gaps.push(member.member),
                    }
                }
                if strict && !gaps.is_empty() {
                    self.stats.unresolvable.fetch_add(1, Ordering::Relaxed);
                    warn!(%id, missing = gaps.len(), "relation unresolvable under strict policy");
                    return Ok(Build::Absent);
                }
                if parts.is_empty() {
                    self.stats.unresolvable.fetch_add(1, Ordering::Relaxed);
                    return Ok(Build::Absent);
                }
                let geom = match self.config.relation_geometry {
                    RelationGeometry::Collection => Geometry::Collection(parts),
                    RelationGeometry::Envelope => {
                        let bounds = parts
                            .iter()
                            .filter_map(Geometry::bounds)
                            .fold(None, Bounds::fold);
                        match bounds {
                            Some(bounds) => Geometry::Envelope(bounds),
                            None => {
                                self.stats.unresolvable.fetch_add(1, Ordering::Relaxed);
                                return Ok(Build::Absent);
                            }
                        }
                    }
                };
                Ok(Build::Row(MaterializedGeometry::new(id, sequence, geom, gaps)))
            }
        }
    }

    /// Current materialized row of a referenced element: batch-local results
    /// first, then the shard-owned cache, then the batch snapshot.
    async fn resolve(
        &mut self,
        snapshot: &S::Snapshot,
        results: &AHashMap<TypedId, Option<MaterializedGeometry>>,
        id: TypedId,
    ) -> Result<Option<MaterializedGeometry>, OsmError> {
        if let Some(result) = results.get(&id) {
            return Ok(result.clone());
        }
        let own = staging::shard_of(id, self.shard_count) == self.shard;
        if own && let Some(row) = self.cache.get(&id) {
            return Ok(Some(row.clone()));
        }
        let row = match snapshot.read(Table::Spatial, &typed_id_key(id)).await? {
            Some(bytes) => Some(decode_value::<MaterializedGeometry>(&bytes)?),
            None => None,
        };
        if own && let Some(row) = &row {
            self.cache.put(id, row.clone());
        }
        Ok(row)
    }

    /// Upsert or delete one spatial row plus its envelope and cell-index
    /// entries. Returns whether the stored geometry actually changed.
    async fn write_row<T: StoreTxn>(
        &self,
        txn: &mut T,
        id: TypedId,
        result: &Option<MaterializedGeometry>,
    ) -> Result<bool, OsmError> {
        let key = typed_id_key(id);
        let old: Option<MaterializedGeometry> = match txn.read(Table::Spatial, &key).await? {
            Some(bytes) => Some(decode_value(&bytes)?),
            None => None,
        };

        match result {
            Some(row) => {
                let changed = old.as_ref().map(|o| &o.geom) != Some(&row.geom);
                if let Some(old) = &old {
                    for cell in &old.cells {
                        if !row.cells.contains(cell) {
                            txn.delete(Table::SpatialCells, cell_key(*cell, id));
                        }
                    }
                }
                for cell in &row.cells {
                    txn.put(Table::SpatialCells, cell_key(*cell, id), bytes::Bytes::new());
                }
                if let Some(bounds) = row.geom.bounds() {
                    txn.put_envelope(Table::Spatial, key.clone(), bounds);
                }
                txn.put(Table::Spatial, key, encode_value(row)?.into());
                Ok(changed)
            }
            None => match old {
                Some(old) => {
                    for cell in &old.cells {
                        txn.delete(Table::SpatialCells, cell_key(*cell, id));
                    }
                    txn.delete_envelope(Table::Spatial, key.clone());
                    txn.delete(Table::Spatial, key);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

/// Convenience used by tests and the facade: tick a single worker until its
/// queue is empty. With one shard this fully drains the staging table.
pub async fn drain_worker<S: Store>(worker: &mut ShardWorker<S>) -> Result<usize, OsmError> {
    let mut total = 0usize;
    loop {
        let drained = worker.tick().await?;
        if drained == 0 {
            return Ok(total);
        }
        total += drained;
    }
}

// The kind ordering nodes < ways < relations is what makes the
// (depth, typed id) sort topological for equal depths.
const _: () = {
    assert!((ElementKind::Node as u64) < (ElementKind::Way as u64));
    assert!((ElementKind::Way as u64) < (ElementKind::Relation as u64));
};
