//! Materialized geometry shapes and the spatial rows the materializer
//! maintains for every currently visible, resolvable element.

use serde::{Deserialize, Serialize};

use crate::ident::TypedId;
use crate::internal::element::bounds::{Bounds, Coord};
use crate::internal::element::cell::CellId;

/// Shape of an element's materialized geometry.
///
/// Nodes are points; ways are line strings (a one-node way degrades to a
/// point); relations are either a collection of their members' geometries or
/// just an envelope, depending on configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Collection(Vec<Geometry>),
    Envelope(Bounds),
}

impl Geometry {
    /// Build a way geometry from resolved member points. One point becomes a
    /// `Point`, two or more a `LineString`. `None` for an empty input.
    pub fn from_points(mut points: Vec<Coord>) -> Option<Geometry> {
        match points.len() {
            0 => None,
            1 => Some(Geometry::Point(points.remove(0))),
            _ => Some(Geometry::LineString(points)),
        }
    }

    /// Envelope of the shape; `None` for an empty collection.
    pub fn bounds(&self) -> Option<Bounds> {
        match self {
            Geometry::Point(c) => Some(Bounds::point(*c)),
            Geometry::LineString(points) => {
                let mut iter = points.iter();
                let mut bounds = Bounds::point(*iter.next()?);
                for c in iter {
                    bounds.extend(*c);
                }
                Some(bounds)
            }
            Geometry::Collection(members) => members
                .iter()
                .filter_map(Geometry::bounds)
                .fold(None, |acc, b| Bounds::fold(acc, b)),
            Geometry::Envelope(b) => Some(*b),
        }
    }
}

/// One row of the materialized spatial table: the latest geometry of an
/// element that is visible and resolvable, stamped with the element-log
/// sequence state it was derived from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializedGeometry {
    pub id: TypedId,
    /// Highest element-log `sequence_id` among the rows that contributed to
    /// this shape.
    pub sequence: u64,
    pub geom: Geometry,
    /// Cells covering the geometry, derived at materialization time and
    /// mirrored into the cell index.
    pub cells: Vec<CellId>,
    /// References that were elided under the lenient policy. Empty when the
    /// geometry is complete.
    pub gaps: Vec<TypedId>,
}

impl MaterializedGeometry {
    pub fn new(id: TypedId, sequence: u64, geom: Geometry, gaps: Vec<TypedId>) -> Self {
        let cells = geom
            .bounds()
            .map(|b| CellId::cover(&b, crate::internal::element::cell::COVER_LIMIT))
            .unwrap_or_default();
        Self {
            id,
            sequence,
            geom,
            cells,
            gaps,
        }
    }
}
