//! Fixed-grid spatial cells derived from a geometry's envelope at
//! materialization time.
//!
//! A cell is one square of a quadtree over the plate-carree plane. Cells are
//! addressed by `(zoom, x, y)` and serialized for the cell index as a
//! quadkey: one byte per level, each holding the two-bit child index. Because
//! descendants share their ancestor's quadkey as a byte prefix, "this cell
//! and everything inside it" is a single contiguous key range, and "every
//! ancestor of this cell" is the set of its proper prefixes. Coverage is
//! adaptive: large envelopes coarsen until the cover fits the cell budget.

use serde::{Deserialize, Serialize};

use crate::internal::element::bounds::{Bounds, Coord};

/// Finest grid level. One cell at this zoom is roughly 600m of longitude at
/// the equator.
pub const MAX_ZOOM: u8 = 16;

/// Most cells a single geometry may occupy in the cell index.
pub const COVER_LIMIT: usize = 64;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellId {
    zoom: u8,
    x: u32,
    y: u32,
}

fn axis_index(value: f64, origin: f64, span: f64, zoom: u8) -> u32 {
    let n = 1u64 << zoom;
    let scaled = ((value - origin) / span * n as f64).floor();
    (scaled.clamp(0.0, (n - 1) as f64)) as u32
}

impl CellId {
    /// Cell containing a coordinate at the given zoom.
    pub fn at(c: Coord, zoom: u8) -> CellId {
        let zoom = zoom.min(MAX_ZOOM);
        CellId {
            zoom,
            x: axis_index(c.lon, -180.0, 360.0, zoom),
            y: axis_index(c.lat, -90.0, 180.0, zoom),
        }
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// The enclosing cell one level up, or `None` at the root.
    pub fn parent(&self) -> Option<CellId> {
        if self.zoom == 0 {
            return None;
        }
        Some(CellId {
            zoom: self.zoom - 1,
            x: self.x >> 1,
            y: self.y >> 1,
        })
    }

    /// Quadkey bytes, one two-bit child index per level. Empty at zoom 0.
    pub fn quadkey(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.zoom as usize);
        for level in 1..=self.zoom {
            let shift = self.zoom - level;
            let digit = ((self.x >> shift) & 1) as u8 | (((self.y >> shift) & 1) as u8) << 1;
            key.push(digit);
        }
        key
    }

    /// Rebuild a cell from quadkey bytes. `None` if any byte is not a valid
    /// child index or the key is deeper than [`MAX_ZOOM`].
    pub fn from_quadkey(key: &[u8]) -> Option<CellId> {
        if key.len() > MAX_ZOOM as usize {
            return None;
        }
        let mut x = 0u32;
        let mut y = 0u32;
        for &digit in key {
            if digit > 3 {
                return None;
            }
            x = (x << 1) | (digit & 1) as u32;
            y = (y << 1) | (digit >> 1) as u32;
        }
        Some(CellId {
            zoom: key.len() as u8,
            x,
            y,
        })
    }

    /// Geographic extent of the cell.
    pub fn bounds(&self) -> Bounds {
        let n = (1u64 << self.zoom) as f64;
        let lon_step = 360.0 / n;
        let lat_step = 180.0 / n;
        Bounds::from_corners(
            Coord::new(
                -180.0 + self.x as f64 * lon_step,
                -90.0 + self.y as f64 * lat_step,
            ),
            Coord::new(
                -180.0 + (self.x + 1) as f64 * lon_step,
                -90.0 + (self.y + 1) as f64 * lat_step,
            ),
        )
    }

    /// Cells covering an envelope, at the finest zoom whose cover fits
    /// `max_cells`. Always non-empty; the root cell is the final fallback.
    pub fn cover(bounds: &Bounds, max_cells: usize) -> Vec<CellId> {
        let max_cells = max_cells.max(1);
        for zoom in (0..=MAX_ZOOM).rev() {
            let lo = CellId::at(Coord::new(bounds.min_lon, bounds.min_lat), zoom);
            let hi = CellId::at(Coord::new(bounds.max_lon, bounds.max_lat), zoom);
            let count = (hi.x - lo.x + 1) as usize * (hi.y - lo.y + 1) as usize;
            if count > max_cells {
                continue;
            }
            let mut cells = Vec::with_capacity(count);
            for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    cells.push(CellId { zoom, x, y });
                }
            }
            return cells;
        }
        vec![CellId { zoom: 0, x: 0, y: 0 }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadkey_round_trip() {
        let cell = CellId::at(Coord::new(2.35, 48.86), MAX_ZOOM);
        let key = cell.quadkey();
        assert_eq!(key.len(), MAX_ZOOM as usize);
        assert_eq!(CellId::from_quadkey(&key), Some(cell));
    }

    #[test]
    fn quadkey_prefix_is_ancestor() {
        let cell = CellId::at(Coord::new(-0.12, 51.5), MAX_ZOOM);
        let parent = cell.parent().unwrap();
        let key = cell.quadkey();
        assert_eq!(CellId::from_quadkey(&key[..key.len() - 1]), Some(parent));
    }

    #[test]
    fn cell_bounds_contain_the_seed_coordinate() {
        let c = Coord::new(13.4, 52.52);
        for zoom in [0, 4, 9, MAX_ZOOM] {
            assert!(CellId::at(c, zoom).bounds().contains(c));
        }
    }

    #[test]
    fn cover_respects_the_cell_budget() {
        let world = Bounds::from_corners(Coord::new(-179.9, -89.9), Coord::new(179.9, 89.9));
        let cover = CellId::cover(&world, COVER_LIMIT);
        assert!(!cover.is_empty());
        assert!(cover.len() <= COVER_LIMIT);

        let tiny = Bounds::point(Coord::new(2.0, 49.0));
        let cover = CellId::cover(&tiny, COVER_LIMIT);
        assert_eq!(cover.len(), 1);
        assert_eq!(cover[0].zoom(), MAX_ZOOM);
    }

    #[test]
    fn invalid_quadkeys_are_rejected() {
        assert!(CellId::from_quadkey(&[4]).is_none());
        assert!(CellId::from_quadkey(&[0; MAX_ZOOM as usize + 1]).is_none());
    }
}
