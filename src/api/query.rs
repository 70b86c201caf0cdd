//! Read-side query surface. Every reader is pinned to one watermark: the
//! snapshot it holds observes exactly the rows committed at or below that
//! sequence id, so geometry, membership and history answers are mutually
//! consistent no matter how far the writers have moved on.

use std::collections::BTreeSet;

use crate::config::CoreConfig;
use crate::errors::OsmError;
use crate::ident::{ElementKind, TypedId};
use crate::internal::changeset::{Changeset, ChangesetManager};
use crate::internal::element::bounds::Bounds;
use crate::internal::element::cell::CellId;
use crate::internal::element::geometry::{Geometry, MaterializedGeometry};
use crate::internal::element::version::ElementVersion;
use crate::internal::log::ElementLog;
use crate::internal::store::codec::{
    cell_exact_prefix, cell_key_element, cell_subtree_prefix, changeset_bounds_key_changeset,
    changeset_user_key_changeset, decode_value, prefix_end, read_u64_key, typed_id_key, u64_key,
};
use crate::internal::store::{SequenceId, StoreRead, Table};

/// A consistent read view at one watermark.
///
/// Two snapshots back one logical view: element-log and changeset reads pin
/// to the watermark itself, while spatial reads pin to the watermark row's
/// store cutoff, where the geometry derived from log rows at or below the
/// watermark actually lives. Together they are the torn-state-free view the
/// watermark contract promises.
pub struct QueryReader<R: StoreRead> {
    log: R,
    spatial: R,
    at: SequenceId,
    limit: usize,
}

impl<R: StoreRead> QueryReader<R> {
    pub fn new(log: R, spatial: R, at: SequenceId, config: &CoreConfig) -> Self {
        Self {
            log,
            spatial,
            at,
            limit: config.query_result_limit,
        }
    }

    /// The watermark this reader is pinned to.
    pub fn watermark(&self) -> SequenceId {
        self.at
    }

    /// One element version; the latest when `version` is `None`.
    pub async fn get_element(
        &self,
        id: TypedId,
        version: Option<u64>,
    ) -> Result<ElementVersion, OsmError> {
        let row = match version {
            Some(version) => ElementLog::get(&self.log, id, version).await?,
            None => ElementLog::get_latest(&self.log, id).await?,
        };
        row.ok_or_else(|| OsmError::NotFound(id.to_string()))
    }

    /// Current materialized geometry, or `None` when the element is deleted
    /// or unresolvable at this watermark.
    pub async fn get_geometry(&self, id: TypedId) -> Result<Option<Geometry>, OsmError> {
        Ok(self.spatial_row(id).await?.map(|row| row.geom))
    }

    /// The full materialized row, including gap annotations and cells.
    pub async fn spatial_row(
        &self,
        id: TypedId,
    ) -> Result<Option<MaterializedGeometry>, OsmError> {
        match self.spatial.read(Table::Spatial, &typed_id_key(id)).await? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Elements of the given kinds whose geometry intersects `bounds`.
    pub async fn elements_in_bbox(
        &self,
        bounds: &Bounds,
        kinds: &[ElementKind],
    ) -> Result<Vec<MaterializedGeometry>, OsmError> {
        let keys = self
            .spatial
            .scan_envelope(Table::Spatial, bounds, self.limit + 1)
            .await?;
        if keys.len() > self.limit {
            return Err(OsmError::TooManyResults(self.limit));
        }
        let mut rows = Vec::new();
        for key in keys {
            let id = TypedId::from_raw(read_u64_key(&key))?;
            if !kinds.is_empty() && !kinds.contains(&id.kind()) {
                continue;
            }
            if let Some(row) = self.spatial_row(id).await?
                && row.geom.bounds().is_some_and(|b| b.intersects(bounds))
            {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Elements of the given kinds indexed under any of `cells`: entries in
    /// the cell itself, in any descendant cell, or in any ancestor cell
    /// (large geometries are stored coarse).
    pub async fn elements_in_cells(
        &self,
        cells: &[CellId],
        kinds: &[ElementKind],
    ) -> Result<Vec<MaterializedGeometry>, OsmError> {
        let mut ids: BTreeSet<TypedId> = BTreeSet::new();
        for cell in cells {
            // The cell and everything nested inside it share the quadkey
            // prefix.
            let prefix = cell_subtree_prefix(*cell);
            let end = prefix_end(&prefix);
            let rows = self
                .spatial
                .scan(Table::SpatialCells, &prefix, &end, self.limit + 1)
                .await?;
            if rows.len() > self.limit {
                return Err(OsmError::TooManyResults(self.limit));
            }
            for row in rows {
                if let Some(raw) = cell_key_element(&row.key) {
                    ids.insert(TypedId::from_raw(raw)?);
                }
            }
            // Walk the ancestor chain for coarser covers.
            let mut ancestor = cell.parent();
            while let Some(current) = ancestor {
                let prefix = cell_exact_prefix(current);
                let end = prefix_end(&prefix);
                let rows = self
                    .spatial
                    .scan(Table::SpatialCells, &prefix, &end, self.limit + 1)
                    .await?;
                for row in rows {
                    if let Some(raw) = cell_key_element(&row.key) {
                        ids.insert(TypedId::from_raw(raw)?);
                    }
                }
                ancestor = current.parent();
            }
            if ids.len() > self.limit {
                return Err(OsmError::TooManyResults(self.limit));
            }
        }

        let mut rows = Vec::new();
        for id in ids {
            if !kinds.is_empty() && !kinds.contains(&id.kind()) {
                continue;
            }
            if let Some(row) = self.spatial_row(id).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Ways and relations whose latest visible version references `id`.
    pub async fn parents_of(&self, id: TypedId) -> Result<Vec<TypedId>, OsmError> {
        let parents = ElementLog::parents_of(&self.log, id, self.limit + 1).await?;
        if parents.len() > self.limit {
            return Err(OsmError::TooManyResults(self.limit));
        }
        Ok(parents)
    }

    /// Version history ascending, starting after `after_version`. At most
    /// `page` rows (capped by the configured result limit).
    pub async fn history(
        &self,
        id: TypedId,
        after_version: u64,
        page: usize,
    ) -> Result<Vec<ElementVersion>, OsmError> {
        let page = page.min(self.limit);
        let rows = ElementLog::history(&self.log, id, after_version, page).await?;
        if rows.is_empty() && after_version == 0 {
            return Err(OsmError::NotFound(id.to_string()));
        }
        Ok(rows)
    }

    pub async fn get_changeset(&self, id: u64) -> Result<Changeset, OsmError> {
        ChangesetManager::get(&self.log, id).await
    }

    /// Changesets whose recorded commit bounds intersect `bounds`.
    pub async fn changesets_in_bbox(&self, bounds: &Bounds) -> Result<Vec<Changeset>, OsmError> {
        let keys = self
            .log
            .scan_envelope(Table::ChangesetBounds, bounds, self.limit + 1)
            .await?;
        if keys.len() > self.limit {
            return Err(OsmError::TooManyResults(self.limit));
        }
        let ids: BTreeSet<u64> = keys
            .iter()
            .map(|key| changeset_bounds_key_changeset(key))
            .collect();
        let mut changesets = Vec::with_capacity(ids.len());
        for id in ids {
            changesets.push(ChangesetManager::get(&self.log, id).await?);
        }
        Ok(changesets)
    }

    /// Changesets opened by one user, ascending by id.
    pub async fn changesets_by_user(&self, user: u64) -> Result<Vec<Changeset>, OsmError> {
        let prefix = u64_key(user);
        let end = prefix_end(&prefix);
        let rows = self
            .log
            .scan(Table::ChangesetUser, &prefix, &end, self.limit + 1)
            .await?;
        if rows.len() > self.limit {
            return Err(OsmError::TooManyResults(self.limit));
        }
        let mut changesets = Vec::with_capacity(rows.len());
        for row in rows {
            let id = changeset_user_key_changeset(&row.key);
            changesets.push(ChangesetManager::get(&self.log, id).await?);
        }
        Ok(changesets)
    }
}
