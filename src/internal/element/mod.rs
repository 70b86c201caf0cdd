//! Element model definitions for map nodes, ways and relations, and the
//! geometry types their materialized shapes are built from.
//!
//! # Element Write-to-Read Flow
//!
//! ```text
//!  ①  Mutation batch (create / modify / delete)
//!       │
//!       ▼
//!  ②  CommitPipeline              ← validates versions and references
//!       │
//!       ├──▶ ElementLog           ← append-only (typed_id, version) rows
//!       ├──▶ ChangesetManager     ← size, counts, union bounds
//!       └──▶ staging queue        ← touched typed ids, depth 0
//!       │
//!       ▼
//!  ③  SpatialMaterializer
//!       │
//!       ├─ DependencyResolver     ← ways over changed nodes, relations
//!       │                            over changed ways/relations
//!       ├─ geometry rebuild       ← (depth, typed id) order
//!       └─ watermark advance      ← readers never see torn state
//!       │
//!       ▼
//!  ④  MaterializedGeometry + cell index
//!       │
//!       ▼
//!  ⑤  QueryAPI                    ← bbox / cells / history / parents,
//!                                    pinned to the watermark
//! ```
//!
//! An [`ElementVersion`](version::ElementVersion) is born at commit and never
//! mutated afterwards; only its `latest` flag flips when a newer version of
//! the same element lands. Deletion is a version with `visible = false` and
//! no body. Geometry never lives on the log rows themselves: nodes carry raw
//! coordinates, ways and relations only references, and everything a reader
//! sees is derived by the materializer.

pub mod body;
pub mod bounds;
pub mod cell;
pub mod geometry;
pub mod version;

use std::collections::BTreeMap;

/// Free-form `key=value` tags. Ordered so encodings and batch fingerprints
/// are deterministic.
pub type TagMap = BTreeMap<String, String>;
