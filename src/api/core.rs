//! The core handle: owns the components, exposes the narrow write/read
//! interface, and spawns the background pipelines.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::query::QueryReader;
use crate::config::CoreConfig;
use crate::errors::OsmError;
use crate::internal::changeset::{Changeset, ChangesetManager};
use crate::internal::commit::{CommitPipeline, CommitReceipt, Mutation};
use crate::internal::element::TagMap;
use crate::internal::materialize::staging::DepthGauge;
use crate::internal::materialize::watermark::{self, WatermarkRow};
use crate::internal::materialize::{MaterializerReport, MaterializerStats, SpatialMaterializer};
use crate::internal::store::{SequenceId, Store, StoreTxn};

/// Operational snapshot of the core, for logs and health endpoints.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CoreStatus {
    pub watermark: SequenceId,
    pub head: SequenceId,
    pub staging_depth: usize,
    pub materializer: MaterializerReport,
}

/// Handle to the element store core. All state lives in the store and in
/// shared gauges; hold it in an `Arc` to share across handlers.
pub struct OsmCore<S: Store> {
    store: S,
    config: Arc<CoreConfig>,
    changesets: Arc<ChangesetManager>,
    pipeline: CommitPipeline<S>,
    materializer: SpatialMaterializer<S>,
    depth: Arc<DepthGauge>,
    stats: Arc<MaterializerStats>,
}

impl<S: Store> OsmCore<S> {
    /// Wire the components over a store handle and seed the gauges.
    pub async fn open(store: S, config: CoreConfig) -> Result<Self, OsmError> {
        let config = Arc::new(config);
        let changesets = Arc::new(ChangesetManager::new(config.clone()));
        let depth = Arc::new(DepthGauge::default());
        let stats = Arc::new(MaterializerStats::default());
        let pipeline = CommitPipeline::new(
            store.clone(),
            config.clone(),
            changesets.clone(),
            depth.clone(),
        );
        let materializer = SpatialMaterializer::new(
            store.clone(),
            config.clone(),
            depth.clone(),
            stats.clone(),
        );
        materializer.init().await?;
        info!(shards = config.shard_count(), "element store core opened");
        Ok(Self {
            store,
            config,
            changesets,
            pipeline,
            materializer,
            depth,
            stats,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Open a new changeset and return its id.
    pub async fn open_changeset(
        &self,
        user: Option<u64>,
        tags: TagMap,
        cancel: &CancellationToken,
    ) -> Result<u64, OsmError> {
        if cancel.is_cancelled() {
            return Err(OsmError::Cancelled);
        }
        // The changeset id counter is a hot row; serialize allocations.
        let _guard = self
            .store
            .lock_row(
                crate::internal::store::Table::IdCounter,
                &crate::internal::store::codec::changeset_counter_key(),
            )
            .await?;
        let mut txn = self.store.begin().await?;
        let changeset = self
            .changesets
            .create(&mut txn, user, tags, Utc::now())
            .await?;
        txn.commit().await?;
        Ok(changeset.id)
    }

    /// Replace the tags of an open changeset.
    pub async fn update_changeset(
        &self,
        changeset: u64,
        tags: TagMap,
        cancel: &CancellationToken,
    ) -> Result<Changeset, OsmError> {
        if cancel.is_cancelled() {
            return Err(OsmError::Cancelled);
        }
        let mut txn = self.store.begin().await?;
        let updated = self
            .changesets
            .update_tags(&mut txn, changeset, tags, Utc::now())
            .await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Apply a mutation batch to an open changeset. All-or-nothing.
    pub async fn apply(
        &self,
        changeset: u64,
        mutations: &[Mutation],
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt, OsmError> {
        self.pipeline.apply(changeset, mutations, cancel).await
    }

    /// Close a changeset explicitly.
    pub async fn close_changeset(
        &self,
        changeset: u64,
        cancel: &CancellationToken,
    ) -> Result<Changeset, OsmError> {
        if cancel.is_cancelled() {
            return Err(OsmError::Cancelled);
        }
        let mut txn = self.store.begin().await?;
        let closed = self.changesets.close(&mut txn, changeset, Utc::now()).await?;
        txn.commit().await?;
        Ok(closed)
    }

    /// Current global spatial watermark.
    pub async fn watermark(&self) -> Result<SequenceId, OsmError> {
        Ok(self.pin().await?.hwm)
    }

    /// The current watermark row, usable to pin readers to this moment.
    pub async fn pin(&self) -> Result<WatermarkRow, OsmError> {
        let head = self.store.head().await?;
        let snapshot = self.store.snapshot(head).await?;
        watermark::read_global(&snapshot).await
    }

    /// A consistent reader pinned to a watermark row (a previously obtained
    /// [`OsmCore::pin`]), or to the current watermark. The snapshot is taken
    /// at the row's store cutoff, so the reader observes exactly the
    /// materialized state that watermark describes.
    pub async fn reader(
        &self,
        pin: Option<WatermarkRow>,
    ) -> Result<QueryReader<S::Snapshot>, OsmError> {
        let pin = match pin {
            Some(pin) => pin,
            None => self.pin().await?,
        };
        let log = self.store.snapshot(pin.hwm).await?;
        let spatial = self.store.snapshot(pin.cutoff).await?;
        Ok(QueryReader::new(log, spatial, pin.hwm, &self.config))
    }

    /// Spawn the materializer shards; they run until `cancel` fires.
    pub fn spawn_materializer(
        &self,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.materializer.spawn(cancel)
    }

    /// Spawn the periodic changeset sweeper.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let changesets = self.changesets.clone();
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = changesets.sweep(&store).await {
                    warn!(error = %e, "changeset sweep failed");
                }
            }
        })
    }

    /// One immediate sweep pass; returns how many changesets were closed.
    pub async fn sweep_changesets(&self) -> Result<usize, OsmError> {
        self.changesets.sweep(&self.store).await
    }

    pub fn materializer(&self) -> &SpatialMaterializer<S> {
        &self.materializer
    }

    pub async fn status(&self) -> Result<CoreStatus, OsmError> {
        Ok(CoreStatus {
            watermark: self.watermark().await?,
            head: self.store.head().await?,
            staging_depth: self.depth.current(),
            materializer: self.stats.report(),
        })
    }
}
