//! Error types for the Osm-Internal crate.
//!
//! This module defines the unified error enumeration returned by the element
//! log, changeset management, the commit pipeline, the spatial materializer,
//! and the read-side query surface. It integrates with `thiserror` to provide
//! rich `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Validation and policy errors carry enough context to be returned to the
//!   caller unchanged.
//! - Store-level failures (`Conflict`, `Unavailable`) are wrapped; the commit
//!   pipeline retries `Conflict` with bounded attempts before surfacing it.

use thiserror::Error;

use crate::ident::{ElementKind, TypedId};
use crate::internal::store::StoreError;

#[derive(Error, Debug)]
/// Unified error enumeration for the Osm-Internal library.
///
/// - Used across identifier parsing, changeset commits, materialization and
///   queries.
/// - Implements `std::error::Error` via `thiserror`.
pub enum OsmError {
    /// Element id outside the per-kind id budget.
    #[error("The id `{1}` overflows the {0} id range.")]
    IdOverflow(ElementKind, u64),

    /// A raw 64-bit value that does not decode to any element kind.
    #[error("The value `{0}` is not a valid typed id.")]
    BadTypedId(u64),

    /// Malformed `{id}v{version}` reference, or a member reference that does
    /// not resolve against the element log.
    #[error("The `{0}` is not a valid element reference.")]
    BadReference(String),

    /// Optimistic concurrency failure: the base version named by a mutation
    /// is no longer the latest version of the element.
    #[error("Version conflict on {id}: base version {base} but latest is {latest}")]
    VersionConflict {
        id: TypedId,
        base: u64,
        latest: u64,
    },

    /// The changeset is closed (explicitly, or by the idle/lifetime sweep)
    /// and can no longer accept commits.
    #[error("Changeset {0} is closed")]
    ChangesetClosed(u64),

    /// Admitting the batch would push the changeset past its size cap.
    #[error("Changeset {id} holds {size} edits; adding {batch} exceeds the limit of {limit}")]
    ChangesetOversize {
        id: u64,
        size: u64,
        batch: u64,
        limit: u64,
    },

    /// The staging queue is past its hard limit; the commit must be retried
    /// once the materializer catches up.
    #[error("Staging queue is full, commit rejected")]
    Overloaded,

    /// A read produced more rows than the configured result cap.
    #[error("Query matched more than {0} results")]
    TooManyResults(usize),

    /// Element, version or changeset not present.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller's cancellation signal fired before the operation committed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Store-level failure (optimistic conflict or infrastructure outage).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
