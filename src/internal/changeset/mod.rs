//! Changeset lifecycle: open, growing with every commit, closed exactly once.
//!
//! ## Status Transitions
//!
//! ```text
//!  Open ──commit──▶ Open          (size, counts and union bounds grow)
//!    │
//!    ├── explicit close
//!    ├── idle timeout  ─┐
//!    └── max lifetime  ─┴──▶ Closed (terminal, immutable)
//! ```
//!
//! A changeset is open iff it has no `closed_at` and neither the idle window
//! nor the lifetime window has elapsed. The sweeper turns the two time-based
//! conditions into explicit `closed_at` stamps so the open-set index stays
//! small; until it runs, `is_open` already answers correctly, so commits
//! never race the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::errors::OsmError;
use crate::internal::element::TagMap;
use crate::internal::element::bounds::Bounds;
use crate::internal::store::codec::{
    changeset_bounds_key, changeset_counter_key, changeset_key, decode_value, encode_value,
    prefix_end, u64_key,
};
use crate::internal::store::{SequenceId, Store, StoreRead, StoreTxn, Table};

/// Per-commit create/modify/delete tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditCounts {
    pub creates: u64,
    pub modifies: u64,
    pub deletes: u64,
}

impl EditCounts {
    pub fn total(&self) -> u64 {
        self.creates + self.modifies + self.deletes
    }
}

/// Header row of one changeset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: u64,
    pub user: Option<u64>,
    pub tags: TagMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Total element versions attributed to this changeset.
    pub size: u64,
    pub counts: EditCounts,
    /// Envelope of every commit bounds recorded so far.
    pub bounds: Option<Bounds>,
}

impl Changeset {
    pub fn is_open(&self, now: DateTime<Utc>, config: &CoreConfig) -> bool {
        self.closed_at.is_none()
            && now < self.updated_at + config.changeset_idle_timeout()
            && now < self.created_at + config.changeset_max_lifetime()
    }
}

/// One commit's envelope, recorded against its changeset. Never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangesetBoundsRow {
    pub changeset: u64,
    pub sequence: SequenceId,
    pub bounds: Bounds,
}

pub struct ChangesetManager {
    config: Arc<CoreConfig>,
}

impl ChangesetManager {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self { config }
    }

    /// Open a new changeset inside the caller's transaction.
    pub async fn create<T: StoreTxn>(
        &self,
        txn: &mut T,
        user: Option<u64>,
        tags: TagMap,
        now: DateTime<Utc>,
    ) -> Result<Changeset, OsmError> {
        let id = match txn.read(Table::IdCounter, &changeset_counter_key()).await? {
            Some(bytes) => decode_value::<u64>(&bytes)? + 1,
            None => 1,
        };
        txn.put(
            Table::IdCounter,
            changeset_counter_key(),
            encode_value(&id)?.into(),
        );
        let changeset = Changeset {
            id,
            user,
            tags,
            created_at: now,
            updated_at: now,
            closed_at: None,
            size: 0,
            counts: EditCounts::default(),
            bounds: None,
        };
        Self::write(txn, &changeset)?;
        if let Some(user) = user {
            txn.put(
                Table::ChangesetUser,
                crate::internal::store::codec::changeset_user_key(user, id),
                bytes::Bytes::new(),
            );
        }
        debug!(changeset = id, "opened changeset");
        Ok(changeset)
    }

    pub async fn get<R: StoreRead + ?Sized>(reader: &R, id: u64) -> Result<Changeset, OsmError> {
        match reader.read(Table::Changeset, &changeset_key(id)).await? {
            Some(bytes) => Ok(decode_value(&bytes)?),
            None => Err(OsmError::NotFound(format!("changeset {id}"))),
        }
    }

    /// Fetch a changeset and fail with `ChangesetClosed` unless it is open.
    pub async fn require_open<R: StoreRead + ?Sized>(
        &self,
        reader: &R,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Changeset, OsmError> {
        let changeset = Self::get(reader, id).await?;
        if !changeset.is_open(now, &self.config) {
            return Err(OsmError::ChangesetClosed(id));
        }
        Ok(changeset)
    }

    /// Apply one commit's effects: grow size and counts, extend the union
    /// bounds, and record the per-commit bounds row. Fails with
    /// `ChangesetOversize` without mutating anything when the batch would
    /// push past the size cap.
    pub fn admit<T: StoreTxn>(
        &self,
        txn: &mut T,
        changeset: &mut Changeset,
        counts: EditCounts,
        envelope: Option<Bounds>,
        sequence: SequenceId,
        now: DateTime<Utc>,
    ) -> Result<(), OsmError> {
        let batch = counts.total();
        if changeset.size + batch > self.config.max_changeset_size {
            return Err(OsmError::ChangesetOversize {
                id: changeset.id,
                size: changeset.size,
                batch,
                limit: self.config.max_changeset_size,
            });
        }
        changeset.size += batch;
        changeset.counts.creates += counts.creates;
        changeset.counts.modifies += counts.modifies;
        changeset.counts.deletes += counts.deletes;
        changeset.updated_at = now;
        if let Some(envelope) = envelope {
            changeset.bounds = Bounds::fold(changeset.bounds, envelope);
            let row = ChangesetBoundsRow {
                changeset: changeset.id,
                sequence,
                bounds: envelope,
            };
            let key = changeset_bounds_key(changeset.id, sequence);
            txn.put(Table::ChangesetBounds, key.clone(), encode_value(&row)?.into());
            txn.put_envelope(Table::ChangesetBounds, key, envelope);
        }
        Self::write(txn, changeset)?;
        Ok(())
    }

    /// Replace the tags of an open changeset.
    pub async fn update_tags<T: StoreTxn>(
        &self,
        txn: &mut T,
        id: u64,
        tags: TagMap,
        now: DateTime<Utc>,
    ) -> Result<Changeset, OsmError> {
        let mut changeset = self.require_open(txn, id, now).await?;
        changeset.tags = tags;
        changeset.updated_at = now;
        Self::write(txn, &changeset)?;
        Ok(changeset)
    }

    /// Close explicitly. Closing an already-closed changeset is an error;
    /// the sweep path uses [`ChangesetManager::close_if_expired`] instead.
    pub async fn close<T: StoreTxn>(
        &self,
        txn: &mut T,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Changeset, OsmError> {
        let mut changeset = self.require_open(txn, id, now).await?;
        changeset.closed_at = Some(now);
        Self::write(txn, &changeset)?;
        info!(changeset = id, size = changeset.size, "closed changeset");
        Ok(changeset)
    }

    /// Stamp `closed_at` on an expired open changeset. Returns whether the
    /// row changed, so the sweep stays idempotent.
    pub async fn close_if_expired<T: StoreTxn>(
        &self,
        txn: &mut T,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, OsmError> {
        let mut changeset = Self::get(txn, id).await?;
        if changeset.closed_at.is_some() || changeset.is_open(now, &self.config) {
            return Ok(false);
        }
        changeset.closed_at = Some(now);
        Self::write(txn, &changeset)?;
        Ok(true)
    }

    /// One sweep pass: close every open changeset whose idle or lifetime
    /// window elapsed. Each close is its own transaction, so a crash midway
    /// leaves a smaller idempotent rerun.
    pub async fn sweep<S: Store>(&self, store: &S) -> Result<usize, OsmError> {
        let now = Utc::now();
        let head = store.head().await?;
        let snapshot = store.snapshot(head).await?;
        let rows = snapshot
            .scan(Table::ChangesetOpen, &[], &[], usize::MAX)
            .await?;

        let mut closed = 0usize;
        for row in rows {
            let id = crate::internal::store::codec::read_u64_key(&row.key);
            let changeset = Self::get(&snapshot, id).await?;
            if changeset.is_open(now, &self.config) {
                continue;
            }
            let _guard = store.lock_row(Table::Changeset, &changeset_key(id)).await?;
            let mut txn = store.begin().await?;
            if self.close_if_expired(&mut txn, id, now).await? {
                txn.commit().await?;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "changeset sweep pass finished");
        }
        Ok(closed)
    }

    /// Per-commit bounds rows of one changeset, in commit order.
    pub async fn bounds_rows<R: StoreRead + ?Sized>(
        reader: &R,
        id: u64,
        limit: usize,
    ) -> Result<Vec<ChangesetBoundsRow>, OsmError> {
        let prefix = u64_key(id);
        let end = prefix_end(&prefix);
        let rows = reader
            .scan(Table::ChangesetBounds, &prefix, &end, limit)
            .await?;
        rows.iter()
            .map(|row| decode_value(&row.value).map_err(OsmError::from))
            .collect()
    }

    /// Persist the header row and keep the open-set index in step.
    fn write<T: StoreTxn>(txn: &mut T, changeset: &Changeset) -> Result<(), OsmError> {
        txn.put(
            Table::Changeset,
            changeset_key(changeset.id),
            encode_value(changeset)?.into(),
        );
        let open_key = changeset_key(changeset.id);
        if changeset.closed_at.is_none() {
            txn.put(
                Table::ChangesetOpen,
                open_key,
                encode_value(&changeset.updated_at)?.into(),
            );
        } else {
            txn.delete(Table::ChangesetOpen, open_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::element::bounds::Coord;
    use crate::internal::store::memory::MemStore;

    fn manager(max_size: u64) -> ChangesetManager {
        ChangesetManager::new(Arc::new(CoreConfig {
            max_changeset_size: max_size,
            ..CoreConfig::default()
        }))
    }

    async fn open_one(store: &MemStore, manager: &ChangesetManager) -> Changeset {
        let mut txn = store.begin().await.unwrap();
        let changeset = manager
            .create(&mut txn, Some(7), TagMap::new(), Utc::now())
            .await
            .unwrap();
        txn.commit().await.unwrap();
        changeset
    }

    #[tokio::test]
    async fn changeset_ids_are_sequential() {
        let store = MemStore::new();
        let manager = manager(100);
        assert_eq!(open_one(&store, &manager).await.id, 1);
        assert_eq!(open_one(&store, &manager).await.id, 2);
    }

    #[tokio::test]
    async fn admit_grows_size_counts_and_bounds() {
        let store = MemStore::new();
        let manager = manager(100);
        let mut changeset = open_one(&store, &manager).await;

        let mut txn = store.begin().await.unwrap();
        let envelope = Bounds::point(Coord::new(2.0, 49.0));
        manager
            .admit(
                &mut txn,
                &mut changeset,
                EditCounts {
                    creates: 2,
                    modifies: 1,
                    deletes: 0,
                },
                Some(envelope),
                10,
                Utc::now(),
            )
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(changeset.size, 3);
        assert_eq!(changeset.counts.creates, 2);
        assert!(changeset.bounds.unwrap().contains(Coord::new(2.0, 49.0)));

        let snapshot = store.snapshot(u64::MAX).await.unwrap();
        let rows = ChangesetManager::bounds_rows(&snapshot, changeset.id, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence, 10);
    }

    #[tokio::test]
    async fn oversize_batches_are_rejected_without_effect() {
        let store = MemStore::new();
        let manager = manager(3);
        let mut changeset = open_one(&store, &manager).await;
        changeset.size = 3;

        let mut txn = store.begin().await.unwrap();
        let result = manager.admit(
            &mut txn,
            &mut changeset,
            EditCounts {
                creates: 1,
                ..EditCounts::default()
            },
            None,
            11,
            Utc::now(),
        );
        assert!(matches!(result, Err(OsmError::ChangesetOversize { .. })));
        assert_eq!(changeset.size, 3);
    }

    #[tokio::test]
    async fn closed_changesets_reject_further_work() {
        let store = MemStore::new();
        let manager = manager(100);
        let changeset = open_one(&store, &manager).await;

        let mut txn = store.begin().await.unwrap();
        manager.close(&mut txn, changeset.id, Utc::now()).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        assert!(matches!(
            manager
                .require_open(&txn, changeset.id, Utc::now())
                .await,
            Err(OsmError::ChangesetClosed(_))
        ));
        assert!(matches!(
            manager.close(&mut txn, changeset.id, Utc::now()).await,
            Err(OsmError::ChangesetClosed(_))
        ));
    }

    #[tokio::test]
    async fn sweep_closes_idle_changesets_idempotently() {
        let store = MemStore::new();
        let config = Arc::new(CoreConfig {
            changeset_idle_timeout_secs: 0,
            ..CoreConfig::default()
        });
        let manager = ChangesetManager::new(config);
        let changeset = {
            let mut txn = store.begin().await.unwrap();
            let c = manager
                .create(&mut txn, None, TagMap::new(), Utc::now())
                .await
                .unwrap();
            txn.commit().await.unwrap();
            c
        };

        assert_eq!(manager.sweep(&store).await.unwrap(), 1);
        assert_eq!(manager.sweep(&store).await.unwrap(), 0);

        let snapshot = store.snapshot(u64::MAX).await.unwrap();
        let swept = ChangesetManager::get(&snapshot, changeset.id).await.unwrap();
        assert!(swept.closed_at.is_some());
    }
}
