//! The commit pipeline: validates a batch of element mutations and applies
//! it atomically against the element log, the owning changeset, and the
//! materializer's staging queue.
//!
//! The ordered steps inside one store transaction:
//!
//! 1. replay detection by batch fingerprint,
//! 2. the changeset must be open, with size slack for the batch,
//! 3. creates allocate the next id from the kind's monotonic counter,
//! 4. modifies and deletes check their base version against the latest row,
//! 5. member references must resolve against the element log (strict
//!    policy) or are admitted dangling (lenient policy),
//! 6. element rows are appended and the latest flag flips,
//! 7. the commit envelope extends the changeset and lands one bounds row,
//! 8. every row gets a sequence id from the reserved contiguous range,
//! 9. every touched element is staged for materialization at depth 0,
//! 10. commit; store conflicts are retried with bounded attempts.
//!
//! Partial effects are never visible: a failure anywhere rolls back the
//! whole batch, including the reserved sequence ids.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, ReferencePolicy};
use crate::errors::OsmError;
use crate::ident::{ElementKind, TypedId};
use crate::internal::changeset::{ChangesetManager, EditCounts};
use crate::internal::element::TagMap;
use crate::internal::element::body::Body;
use crate::internal::element::bounds::{Bounds, Coord};
use crate::internal::element::version::ElementVersion;
use crate::internal::log::ElementLog;
use crate::internal::materialize::staging::{self, DepthGauge};
use crate::internal::store::codec::{
    changeset_key, decode_value, encode_value, fingerprint_key, id_counter_key,
};
use crate::internal::store::{SequenceId, Store, StoreError, StoreRead, StoreTxn, Table};

/// One element mutation inside a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Create {
        kind: ElementKind,
        tags: TagMap,
        body: Body,
    },
    Modify {
        id: TypedId,
        base_version: u64,
        tags: TagMap,
        body: Body,
    },
    Delete {
        id: TypedId,
        base_version: u64,
    },
}

/// Durable outcome of one applied batch. Stored under the batch fingerprint
/// so a replayed ingest returns the original receipt instead of re-applying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// The commit's sequence id (highest id of the contiguous range).
    pub sequence: SequenceId,
    /// Typed ids allocated for `Create` mutations, in batch order.
    pub created: Vec<TypedId>,
}

pub struct CommitPipeline<S: Store> {
    store: S,
    config: Arc<CoreConfig>,
    changesets: Arc<ChangesetManager>,
    depth: Arc<DepthGauge>,
}

impl<S: Store> CommitPipeline<S> {
    pub fn new(
        store: S,
        config: Arc<CoreConfig>,
        changesets: Arc<ChangesetManager>,
        depth: Arc<DepthGauge>,
    ) -> Self {
        Self {
            store,
            config,
            changesets,
            depth,
        }
    }

    /// Apply one mutation batch to a changeset. All-or-nothing; safe to call
    /// concurrently from many writers.
    pub async fn apply(
        &self,
        changeset_id: u64,
        mutations: &[Mutation],
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt, OsmError> {
        if mutations.is_empty() {
            return Ok(CommitReceipt {
                sequence: self.store.head().await?,
                created: Vec::new(),
            });
        }
        self.wait_for_capacity(cancel).await?;
        let digest = batch_fingerprint(changeset_id, mutations);

        let mut attempts = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(OsmError::Cancelled);
            }
            match self.try_apply(changeset_id, mutations, digest).await {
                Err(OsmError::Store(StoreError::Conflict))
                    if attempts + 1 < self.config.commit_retry_limit =>
                {
                    attempts += 1;
                    warn!(changeset = changeset_id, attempts, "commit conflict, retrying batch");
                }
                other => return other,
            }
        }
    }

    /// One transactional attempt at the whole batch.
    async fn try_apply(
        &self,
        changeset_id: u64,
        mutations: &[Mutation],
        digest: [u8; 32],
    ) -> Result<CommitReceipt, OsmError> {
        // Serialize per changeset: every commit rewrites the header row, and
        // the advisory lock turns would-be conflicts into short waits.
        let _guard = self
            .store
            .lock_row(Table::Changeset, &changeset_key(changeset_id))
            .await?;
        let mut txn = self.store.begin().await?;

        if let Some(bytes) = txn.read(Table::Fingerprint, &fingerprint_key(digest)).await? {
            let receipt: CommitReceipt = decode_value(&bytes)?;
            debug!(
                changeset = changeset_id,
                sequence = receipt.sequence,
                fingerprint = %hex::encode(digest),
                "replayed batch deduplicated"
            );
            return Ok(receipt);
        }

        let now = Utc::now();
        let mut changeset = self
            .changesets
            .require_open(&txn, changeset_id, now)
            .await?;

        let range = txn.reserve_sequences(mutations.len() as u64).await?;
        let mut sequences = range.iter();

        let mut rows = Vec::with_capacity(mutations.len());
        let mut created = Vec::new();
        let mut counts = EditCounts::default();
        let mut envelope: Option<Bounds> = None;

        for mutation in mutations {
            let sequence = sequences.next().expect("reserved one sequence per mutation");
            let row = match mutation {
                Mutation::Create { kind, tags, body } => {
                    counts.creates += 1;
                    let id = self.allocate_id(&mut txn, *kind).await?;
                    body.validate(id)?;
                    self.resolve_references(&txn, body, &mut envelope).await?;
                    created.push(id);
                    ElementVersion::visible(id, 1, changeset_id, tags.clone(), body.clone(), now, sequence)
                }
                Mutation::Modify {
                    id,
                    base_version,
                    tags,
                    body,
                } => {
                    counts.modifies += 1;
                    let latest = self.require_latest(&txn, *id, *base_version).await?;
                    body.validate(*id)?;
                    self.extend_with_previous(&latest, &mut envelope);
                    self.resolve_references(&txn, body, &mut envelope).await?;
                    ElementVersion::visible(
                        *id,
                        latest.version + 1,
                        changeset_id,
                        tags.clone(),
                        body.clone(),
                        now,
                        sequence,
                    )
                }
                Mutation::Delete { id, base_version } => {
                    counts.deletes += 1;
                    let latest = self.require_latest(&txn, *id, *base_version).await?;
                    if !latest.visible {
                        return Err(OsmError::NotFound(format!("{id} is already deleted")));
                    }
                    self.extend_with_previous(&latest, &mut envelope);
                    ElementVersion::deleted(*id, latest.version + 1, changeset_id, now, sequence)
                }
            };
            rows.push(row);
        }

        ElementLog::append(&mut txn, &rows).await?;
        self.changesets
            .admit(&mut txn, &mut changeset, counts, envelope, range.last(), now)?;

        let mut enqueued = 0usize;
        for row in &rows {
            if staging::enqueue(&mut txn, row.id, row.sequence, range.last(), 0).await? {
                enqueued += 1;
            }
        }

        let receipt = CommitReceipt {
            sequence: range.last(),
            created,
        };
        txn.put(
            Table::Fingerprint,
            fingerprint_key(digest),
            encode_value(&receipt)?.into(),
        );

        txn.commit().await?;
        self.depth.record_enqueued(enqueued);
        info!(
            changeset = changeset_id,
            sequence = receipt.sequence,
            creates = counts.creates,
            modifies = counts.modifies,
            deletes = counts.deletes,
            "committed mutation batch"
        );
        Ok(receipt)
    }

    /// Next id from the kind's monotonic counter.
    async fn allocate_id<T: StoreTxn>(
        &self,
        txn: &mut T,
        kind: ElementKind,
    ) -> Result<TypedId, OsmError> {
        let key = id_counter_key(kind);
        let next = match txn.read(Table::IdCounter, &key).await? {
            Some(bytes) => decode_value::<u64>(&bytes)? + 1,
            None => 1,
        };
        let id = TypedId::new(kind, next)?;
        txn.put(Table::IdCounter, key, encode_value(&next)?.into());
        Ok(id)
    }

    /// Latest row of an element, checked against the caller's base version.
    async fn require_latest<T: StoreTxn>(
        &self,
        txn: &T,
        id: TypedId,
        base_version: u64,
    ) -> Result<ElementVersion, OsmError> {
        let latest = ElementLog::get_latest(txn, id)
            .await?
            .ok_or_else(|| OsmError::NotFound(id.to_string()))?;
        if latest.version != base_version {
            return Err(OsmError::VersionConflict {
                id,
                base: base_version,
                latest: latest.version,
            });
        }
        Ok(latest)
    }

    /// Resolve every reference in a new body. Under the strict policy a
    /// reference to an element with no log entry at all is a `BadReference`;
    /// under the lenient policy it is admitted dangling. Referenced node
    /// coordinates extend the commit envelope either way.
    async fn resolve_references<T: StoreTxn>(
        &self,
        txn: &T,
        body: &Body,
        envelope: &mut Option<Bounds>,
    ) -> Result<(), OsmError> {
        for reference in body.references() {
            match ElementLog::get_latest(txn, reference).await? {
                Some(row) => {
                    if row.visible
                        && let Some(Body::Node { lon, lat }) = row.body
                    {
                        *envelope = Bounds::fold(*envelope, Bounds::point(Coord::new(lon, lat)));
                    }
                }
                None => {
                    if self.config.reference_policy == ReferencePolicy::Strict {
                        return Err(OsmError::BadReference(reference.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// A modified or deleted element also touches the area it used to
    /// occupy; pure relation edits contribute nothing (their geometry is
    /// entirely derived).
    fn extend_with_previous(&self, previous: &ElementVersion, envelope: &mut Option<Bounds>) {
        if let Some(Body::Node { lon, lat }) = &previous.body {
            *envelope = Bounds::fold(*envelope, Bounds::point(Coord::new(*lon, *lat)));
        }
    }

    /// Hold commits while the staging queue is past its soft limit; reject
    /// outright past the hard limit.
    async fn wait_for_capacity(&self, cancel: &CancellationToken) -> Result<(), OsmError> {
        loop {
            let depth = self.depth.current();
            if depth >= self.config.staging_hard_limit {
                return Err(OsmError::Overloaded);
            }
            if depth < self.config.staging_soft_limit {
                return Ok(());
            }
            debug!(depth, "staging queue above soft limit, delaying commit");
            tokio::select! {
                _ = cancel.cancelled() => return Err(OsmError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
    }
}

/// SHA-256 over the canonical encoding of `(changeset_id, mutations)`.
/// Identical replays of a batch map to the same digest; any difference in
/// order, payload or target changeset yields a fresh one.
pub fn batch_fingerprint(changeset_id: u64, mutations: &[Mutation]) -> [u8; 32] {
    let encoded = encode_value(&(changeset_id, mutations))
        .expect("mutation batches always encode");
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.finalize().into()
}
