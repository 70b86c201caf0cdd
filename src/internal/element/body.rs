//! Typed payloads of an element version: raw coordinates for nodes, ordered
//! node references for ways, role-tagged member references for relations.

use serde::{Deserialize, Serialize};

use crate::errors::OsmError;
use crate::ident::{ElementKind, TypedId};

/// One member of a relation: a reference plus its role string ("outer",
/// "stop", ...). Roles are opaque to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub role: String,
    pub member: TypedId,
}

impl Member {
    pub fn new(role: impl Into<String>, member: TypedId) -> Self {
        Self {
            role: role.into(),
            member,
        }
    }
}

/// Payload of a visible element version. The variant must match the kind
/// encoded in the element's typed id; [`Body::validate`] enforces that plus
/// coordinate range and non-empty reference lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Node { lon: f64, lat: f64 },
    Way { refs: Vec<TypedId> },
    Relation { members: Vec<Member> },
}

impl Body {
    /// The element kind this payload shape belongs to.
    pub fn kind(&self) -> ElementKind {
        match self {
            Body::Node { .. } => ElementKind::Node,
            Body::Way { .. } => ElementKind::Way,
            Body::Relation { .. } => ElementKind::Relation,
        }
    }

    /// Every typed id this payload references, in payload order. Empty for
    /// nodes.
    pub fn references(&self) -> Vec<TypedId> {
        match self {
            Body::Node { .. } => Vec::new(),
            Body::Way { refs } => refs.clone(),
            Body::Relation { members } => members.iter().map(|m| m.member).collect(),
        }
    }

    /// Check the payload against the id it is being written for. A visible
    /// way or relation must reference at least one element; node coordinates
    /// must be inside the WGS84 value range.
    pub fn validate(&self, id: TypedId) -> Result<(), OsmError> {
        if self.kind() != id.kind() {
            return Err(OsmError::BadReference(format!(
                "{} body written for {id}",
                self.kind()
            )));
        }
        match self {
            Body::Node { lon, lat } => {
                if !lon.is_finite() || !lat.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
                    return Err(OsmError::BadReference(format!(
                        "coordinates ({lon}, {lat}) out of range for {id}"
                    )));
                }
            }
            Body::Way { refs } => {
                if refs.is_empty() {
                    return Err(OsmError::BadReference(format!("{id} has no node refs")));
                }
                if let Some(r) = refs.iter().find(|r| r.kind() != ElementKind::Node) {
                    return Err(OsmError::BadReference(format!("{id} references {r}")));
                }
            }
            Body::Relation { members } => {
                if members.is_empty() {
                    return Err(OsmError::BadReference(format!("{id} has no members")));
                }
            }
        }
        Ok(())
    }
}
