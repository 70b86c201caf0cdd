//! Axis-aligned lon/lat envelopes, used for commit bounds, changeset union
//! bounds, and the envelope secondary indexes.

use rstar::AABB;
use serde::{Deserialize, Serialize};

/// A single WGS84 coordinate, longitude first.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lon: f64,
    pub lat: f64,
}

impl Coord {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Axis-aligned bounding box over lon/lat. Always non-empty: the smallest
/// bounds is a single point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// Degenerate bounds covering a single coordinate.
    pub fn point(c: Coord) -> Self {
        Self {
            min_lon: c.lon,
            min_lat: c.lat,
            max_lon: c.lon,
            max_lat: c.lat,
        }
    }

    pub fn from_corners(min: Coord, max: Coord) -> Self {
        Self {
            min_lon: min.lon.min(max.lon),
            min_lat: min.lat.min(max.lat),
            max_lon: min.lon.max(max.lon),
            max_lat: min.lat.max(max.lat),
        }
    }

    /// Grow to cover `c`.
    pub fn extend(&mut self, c: Coord) {
        self.min_lon = self.min_lon.min(c.lon);
        self.min_lat = self.min_lat.min(c.lat);
        self.max_lon = self.max_lon.max(c.lon);
        self.max_lat = self.max_lat.max(c.lat);
    }

    /// Smallest bounds covering both inputs.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    pub fn contains(&self, c: Coord) -> bool {
        c.lon >= self.min_lon && c.lon <= self.max_lon && c.lat >= self.min_lat && c.lat <= self.max_lat
    }

    pub fn center(&self) -> Coord {
        Coord::new(
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// Union of an optional accumulator and a new envelope, for fold loops.
    pub fn fold(acc: Option<Bounds>, next: Bounds) -> Option<Bounds> {
        Some(match acc {
            Some(b) => b.union(&next),
            None => next,
        })
    }

    /// Envelope in the layout the R-tree index expects.
    pub fn to_aabb(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lon, self.min_lat], [self.max_lon, self.max_lat])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_union_cover_inputs() {
        let mut b = Bounds::point(Coord::new(1.0, 1.0));
        b.extend(Coord::new(-2.0, 3.0));
        assert_eq!(b.min_lon, -2.0);
        assert_eq!(b.max_lat, 3.0);
        assert!(b.contains(Coord::new(0.0, 2.0)));

        let other = Bounds::point(Coord::new(10.0, -5.0));
        let u = b.union(&other);
        assert!(u.contains(Coord::new(10.0, -5.0)));
        assert!(u.contains(Coord::new(-2.0, 3.0)));
    }

    #[test]
    fn intersects_is_inclusive_on_edges() {
        let a = Bounds::from_corners(Coord::new(0.0, 0.0), Coord::new(1.0, 1.0));
        let b = Bounds::from_corners(Coord::new(1.0, 1.0), Coord::new(2.0, 2.0));
        let c = Bounds::from_corners(Coord::new(1.5, 1.5), Coord::new(3.0, 3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
