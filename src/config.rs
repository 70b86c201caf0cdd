//! Runtime configuration for the element store, commit pipeline and spatial
//! materializer. All knobs are plain serde fields so a daemon can load them
//! from a config file and tests can override individual limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How missing references are treated, both at commit time (member
/// resolution) and during materialization (unresolvable geometry).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Missing references fail the commit; a way or relation with an
    /// unresolvable member loses its materialized geometry entirely.
    Strict,
    /// Dangling references are admitted; materialization elides the gaps and
    /// records which members were skipped.
    #[default]
    Lenient,
}

/// Shape of a relation's materialized geometry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationGeometry {
    /// True union of the members' geometries.
    #[default]
    Collection,
    /// Only the axis-aligned envelope of the members.
    Envelope,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoreConfig {
    /// Cap on element versions attributed to one changeset.
    pub max_changeset_size: u64,
    /// Seconds without a commit after which an open changeset is swept closed.
    pub changeset_idle_timeout_secs: u64,
    /// Seconds after creation at which an open changeset is swept closed
    /// regardless of activity.
    pub changeset_max_lifetime_secs: u64,
    /// Interval between sweeper passes.
    pub sweep_interval_secs: u64,
    pub reference_policy: ReferencePolicy,
    pub relation_geometry: RelationGeometry,
    /// Number of materializer shards; each owns a disjoint slice of the
    /// typed-id space. Zero means one shard per CPU.
    pub materializer_shards: usize,
    /// Max staging entries claimed per materializer tick.
    pub batch_max: usize,
    /// Max sequence-id span covered by one materializer tick.
    pub batch_sequence_window: u64,
    /// Staging depth at which commits start to back off.
    pub staging_soft_limit: usize,
    /// Staging depth at which commits fail `Overloaded`.
    pub staging_hard_limit: usize,
    /// Seconds a staging claim stays exclusive before the entry is
    /// re-delivered to a restarted shard.
    pub visibility_timeout_secs: u64,
    /// Bound on transitive dependency expansion through relation membership.
    pub relation_max_depth: usize,
    /// Attempts the commit pipeline makes against store conflicts before
    /// surfacing the error.
    pub commit_retry_limit: usize,
    /// Cap on rows returned by one query call.
    pub query_result_limit: usize,
    /// Entries in each shard's resolved-geometry cache.
    pub geometry_cache_entries: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_changeset_size: 10_000,
            changeset_idle_timeout_secs: 3_600,
            changeset_max_lifetime_secs: 86_400,
            sweep_interval_secs: 60,
            reference_policy: ReferencePolicy::default(),
            relation_geometry: RelationGeometry::default(),
            materializer_shards: 1,
            batch_max: 256,
            batch_sequence_window: 1_024,
            staging_soft_limit: 8_192,
            staging_hard_limit: 32_768,
            visibility_timeout_secs: 30,
            relation_max_depth: 8,
            commit_retry_limit: 3,
            query_result_limit: 10_000,
            geometry_cache_entries: 65_536,
        }
    }
}

impl CoreConfig {
    pub fn changeset_idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.changeset_idle_timeout_secs as i64)
    }

    pub fn changeset_max_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.changeset_max_lifetime_secs as i64)
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Effective shard count; `materializer_shards = 0` sizes to the host.
    pub fn shard_count(&self) -> usize {
        if self.materializer_shards == 0 {
            num_cpus::get().max(1)
        } else {
            self.materializer_shards
        }
    }
}
