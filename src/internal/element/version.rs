//! The append-only element version row: one immutable entry per
//! `(typed_id, version)` with the mutable `latest` marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident::TypedId;
use crate::internal::element::TagMap;
use crate::internal::element::body::Body;

/// One version of one element, as stored in the element log.
///
/// Invariants maintained by the log:
/// - `version` starts at 1 and increases by exactly 1 per append.
/// - `body` is `Some` iff `visible`; a deletion occupies a version slot but
///   carries no geometry or members.
/// - `sequence` is globally unique and monotonic over commits.
/// - Exactly one version per element has `latest = true`, and it is the one
///   with the highest `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementVersion {
    pub id: TypedId,
    pub version: u64,
    pub changeset: u64,
    pub visible: bool,
    pub tags: TagMap,
    pub body: Option<Body>,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub latest: bool,
}

impl ElementVersion {
    /// A visible version carrying a payload.
    pub fn visible(
        id: TypedId,
        version: u64,
        changeset: u64,
        tags: TagMap,
        body: Body,
        created_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            version,
            changeset,
            visible: true,
            tags,
            body: Some(body),
            created_at,
            sequence,
            latest: true,
        }
    }

    /// A deletion marker for the next version slot.
    pub fn deleted(
        id: TypedId,
        version: u64,
        changeset: u64,
        created_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            version,
            changeset,
            visible: false,
            tags: TagMap::new(),
            body: None,
            created_at,
            sequence,
            latest: true,
        }
    }

    /// Typed ids this version references; empty for nodes and deletions.
    pub fn references(&self) -> Vec<TypedId> {
        self.body.as_ref().map(Body::references).unwrap_or_default()
    }
}
