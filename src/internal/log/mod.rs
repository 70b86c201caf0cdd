//! Append-only log of element versions, the source of truth for both history
//! and current state.
//!
//! Rows are keyed by `(typed_id, version)` and never mutated after append,
//! with one exception: the previous latest row's `latest` flag flips to
//! `false` in the same transaction that appends its successor. Secondary
//! rows maintained alongside every append:
//!
//! - `ElementLatest`: typed id -> latest version number,
//! - `ElementSequence`: per-row sequence id -> `(typed_id, version)`,
//! - `ElementMembers`: `(member, parent)` pairs for latest visible rows,
//!   backing `parents_of`.
//!
//! References inside way/relation bodies are not validated here; referential
//! integrity belongs to the commit pipeline, and a dangling reference at
//! materialization time is a policy decision, not a log error.

use tracing::debug;

use crate::errors::OsmError;
use crate::ident::TypedId;
use crate::internal::element::version::ElementVersion;
use crate::internal::store::codec::{
    decode_value, element_key, element_prefix, encode_value, member_key, member_key_parent,
    prefix_end, sequence_key, typed_id_key,
};
use crate::internal::store::{SequenceId, StoreRead, StoreTxn, Table};

pub struct ElementLog;

impl ElementLog {
    /// Append a batch of element versions inside the caller's transaction.
    ///
    /// Preconditions checked here (under the same transaction, so batch rows
    /// observe each other):
    /// - each row's `version` is exactly `latest + 1` for its element,
    /// - a `visible = false` row only follows a visible version.
    ///
    /// Postcondition: per touched element, exactly one row has
    /// `latest = true` and it is the highest version.
    pub async fn append<T: StoreTxn>(
        txn: &mut T,
        batch: &[ElementVersion],
    ) -> Result<(), OsmError> {
        for row in batch {
            let current = Self::latest_version(txn, row.id).await?;
            if row.version != current.unwrap_or(0) + 1 {
                return Err(OsmError::VersionConflict {
                    id: row.id,
                    base: row.version.saturating_sub(1),
                    latest: current.unwrap_or(0),
                });
            }

            if let Some(version) = current {
                let mut previous = Self::get(txn, row.id, version)
                    .await?
                    .ok_or_else(|| OsmError::NotFound(format!("{}v{version}", row.id.raw())))?;
                if !row.visible && !previous.visible {
                    return Err(OsmError::NotFound(format!(
                        "{} is already deleted",
                        row.id
                    )));
                }
                // Retire the old latest row and its membership entries.
                previous.latest = false;
                for member in previous.references() {
                    txn.delete(Table::ElementMembers, member_key(member, row.id));
                }
                txn.put(
                    Table::Element,
                    element_key(row.id, version),
                    encode_value(&previous)?.into(),
                );
            } else if !row.visible {
                return Err(OsmError::NotFound(format!(
                    "{} has no version to delete",
                    row.id
                )));
            }

            txn.put(
                Table::Element,
                element_key(row.id, row.version),
                encode_value(row)?.into(),
            );
            txn.put(
                Table::ElementLatest,
                typed_id_key(row.id),
                encode_value(&row.version)?.into(),
            );
            txn.put(
                Table::ElementSequence,
                sequence_key(row.sequence),
                encode_value(&(row.id.raw(), row.version))?.into(),
            );
            if row.visible {
                for member in row.references() {
                    txn.put(
                        Table::ElementMembers,
                        member_key(member, row.id),
                        bytes::Bytes::new(),
                    );
                }
            }
            debug!(id = %row.id, version = row.version, sequence = row.sequence, "appended element version");
        }
        Ok(())
    }

    /// Latest version number of an element, if any version exists.
    pub async fn latest_version<R: StoreRead + ?Sized>(
        reader: &R,
        id: TypedId,
    ) -> Result<Option<u64>, OsmError> {
        match reader.read(Table::ElementLatest, &typed_id_key(id)).await? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get<R: StoreRead + ?Sized>(
        reader: &R,
        id: TypedId,
        version: u64,
    ) -> Result<Option<ElementVersion>, OsmError> {
        match reader.read(Table::Element, &element_key(id, version)).await? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The row currently flagged `latest`, visible or not.
    pub async fn get_latest<R: StoreRead + ?Sized>(
        reader: &R,
        id: TypedId,
    ) -> Result<Option<ElementVersion>, OsmError> {
        match Self::latest_version(reader, id).await? {
            Some(version) => Self::get(reader, id, version).await,
            None => Ok(None),
        }
    }

    /// Versions of one element ascending, starting after `after_version`.
    /// Returns at most `limit` rows; pass `0` to start from the beginning.
    pub async fn history<R: StoreRead + ?Sized>(
        reader: &R,
        id: TypedId,
        after_version: u64,
        limit: usize,
    ) -> Result<Vec<ElementVersion>, OsmError> {
        let start = element_key(id, after_version + 1);
        let end = prefix_end(&element_prefix(id));
        let rows = reader.scan(Table::Element, &start, &end, limit).await?;
        rows.iter()
            .map(|row| decode_value(&row.value).map_err(OsmError::from))
            .collect()
    }

    /// Element versions committed in `(from, to]` sequence order.
    pub async fn scan_by_sequence<R: StoreRead + ?Sized>(
        reader: &R,
        from: SequenceId,
        to: SequenceId,
        limit: usize,
    ) -> Result<Vec<ElementVersion>, OsmError> {
        let start = sequence_key(from + 1);
        let end = sequence_key(to.saturating_add(1));
        let index = reader
            .scan(Table::ElementSequence, &start, &end, limit)
            .await?;
        let mut rows = Vec::with_capacity(index.len());
        for entry in index {
            let (raw, version): (u64, u64) = decode_value(&entry.value)?;
            let id = TypedId::from_raw(raw)?;
            if let Some(row) = Self::get(reader, id, version).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Ways and relations whose latest visible version references `id`.
    pub async fn parents_of<R: StoreRead + ?Sized>(
        reader: &R,
        id: TypedId,
        limit: usize,
    ) -> Result<Vec<TypedId>, OsmError> {
        let prefix = typed_id_key(id);
        let end = prefix_end(&prefix);
        let rows = reader
            .scan(Table::ElementMembers, &prefix, &end, limit)
            .await?;
        rows.iter()
            .map(|row| TypedId::from_raw(member_key_parent(&row.key)))
            .collect()
    }
}
