//! Typed element identifiers with kind encoded by numeric range.
//! Nodes, ways and relations share one 64-bit id space partitioned into
//! contiguous ranges, so ordering by raw value also groups by kind and range
//! scans over a single kind stay contiguous.

use std::{fmt::Display, str::FromStr};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::errors::OsmError;

/// Width of one kind's id range. Each kind owns `[base + 1, base + KIND_SPAN)`
/// where `base` is a multiple of `KIND_SPAN`.
pub const KIND_SPAN: u64 = 1 << 60;

/// Largest per-kind element id that still fits its range.
pub const MAX_ELEMENT_ID: u64 = KIND_SPAN - 1;

/// Kind of a map element (selector only, no data attached).
/// The numeric value doubles as the range index inside [`TypedId`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    Encode,
    Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl ElementKind {
    /// All kinds in range order. Relied on by per-kind scans and counters.
    pub const ALL: [ElementKind; 3] = [ElementKind::Node, ElementKind::Way, ElementKind::Relation];

    /// First raw value of this kind's range (id 0, itself reserved).
    pub const fn base(&self) -> u64 {
        (*self as u64) * KIND_SPAN
    }

    /// Lowercase name of the kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
        }
    }
}

impl Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" => Ok(ElementKind::Node),
            "way" => Ok(ElementKind::Way),
            "relation" => Ok(ElementKind::Relation),
            _ => Err("Invalid element kind".to_string()),
        }
    }
}

/// Packed `(kind, id)` identifier. The high bits select the kind range, the
/// low 60 bits carry the per-kind id, so a plain `u64` ordering partitions by
/// kind first and id second.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Encode, Decode,
)]
pub struct TypedId(u64);

impl TypedId {
    /// Pack a kind and per-kind id. Fails with `IdOverflow` when the id is
    /// zero or past the range width.
    pub fn new(kind: ElementKind, id: u64) -> Result<TypedId, OsmError> {
        if id == 0 || id > MAX_ELEMENT_ID {
            return Err(OsmError::IdOverflow(kind, id));
        }
        Ok(TypedId(kind.base() + id))
    }

    /// Validate a raw 64-bit value. Rejects zero ids and values past the
    /// relation range with `BadTypedId`.
    pub fn from_raw(raw: u64) -> Result<TypedId, OsmError> {
        let range = raw >> 60;
        if range > 2 || (raw & MAX_ELEMENT_ID) == 0 {
            return Err(OsmError::BadTypedId(raw));
        }
        Ok(TypedId(raw))
    }

    /// The raw packed value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The kind selected by the value's range.
    pub const fn kind(&self) -> ElementKind {
        match self.0 >> 60 {
            0 => ElementKind::Node,
            1 => ElementKind::Way,
            _ => ElementKind::Relation,
        }
    }

    /// The per-kind id (low 60 bits).
    pub const fn id(&self) -> u64 {
        self.0 & MAX_ELEMENT_ID
    }

    /// Unpack into `(kind, id)`.
    pub const fn decode(&self) -> (ElementKind, u64) {
        (self.kind(), self.id())
    }

    /// First valid id of a kind's range, for scan lower bounds.
    pub const fn range_start(kind: ElementKind) -> TypedId {
        TypedId(kind.base() + 1)
    }

    /// One past the last valid id of a kind's range, for scan upper bounds.
    pub const fn range_end(kind: ElementKind) -> TypedId {
        TypedId(kind.base() + KIND_SPAN)
    }
}

impl Display for TypedId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// A `{raw_id}v{version}` reference to one element version, as carried in
/// history URLs and export files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ElementRef {
    pub id: TypedId,
    pub version: u64,
}

impl ElementRef {
    pub fn new(id: TypedId, version: u64) -> Self {
        Self { id, version }
    }
}

impl Display for ElementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}v{}", self.id.raw(), self.version)
    }
}

/// Parse `{raw_id}v{version}`. Both parts must be positive decimal integers;
/// anything else (missing separator, sign, zero id, zero version) is a
/// `BadReference`.
impl FromStr for ElementRef {
    type Err = OsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn bad(s: &str) -> OsmError {
            OsmError::BadReference(s.to_string())
        }
        let (raw, version) = s.split_once('v').ok_or_else(|| bad(s))?;
        if raw.is_empty() || version.is_empty() {
            return Err(bad(s));
        }
        // u64 parsing already rejects signs and non-digits.
        let raw: u64 = raw.parse().map_err(|_| bad(s))?;
        let version: u64 = version.parse().map_err(|_| bad(s))?;
        if version == 0 {
            return Err(bad(s));
        }
        let id = TypedId::from_raw(raw).map_err(|_| bad(s))?;
        Ok(ElementRef { id, version })
    }
}
