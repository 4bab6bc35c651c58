//! H3 cells for region and fold blocking.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use h3o::{CellIndex, LatLng, Resolution};

pub const MAX_RESOLUTION: u8 = 15;

pub trait SpatialIndex {
    type Cell: Copy + Eq + Hash + Ord + fmt::Display;

    fn cell_at(&self, latitude: f64, longitude: f64, resolution: u8) -> Option<Self::Cell>;

    fn parent(&self, cell: Self::Cell, resolution: u8) -> Option<Self::Cell>;

    fn ring(&self, cell: Self::Cell, k: u32) -> Vec<Self::Cell>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct H3Grid;

impl SpatialIndex for H3Grid {
    type Cell = CellIndex;

    fn cell_at(&self, latitude: f64, longitude: f64, resolution: u8) -> Option<CellIndex> {
        let resolution = Resolution::try_from(resolution).ok()?;
        let latlng = LatLng::new(latitude, longitude).ok()?;
        Some(latlng.to_cell(resolution))
    }

    fn parent(&self, cell: CellIndex, resolution: u8) -> Option<CellIndex> {
        cell.parent(Resolution::try_from(resolution).ok()?)
    }

    fn ring(&self, cell: CellIndex, k: u32) -> Vec<CellIndex> {
        if k == 0 {
            return vec![cell];
        }
        // Hollow disk; the safe traversal also handles pentagon distortion.
        let inner: HashSet<CellIndex> = cell.grid_disk_safe(k - 1).collect();
        let mut ring: Vec<CellIndex> = cell
            .grid_disk_safe(k)
            .filter(|c| !inner.contains(c))
            .collect();
        ring.sort_unstable();
        ring.dedup();
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_at_rejects_bad_coordinates_and_resolutions() {
        let grid = H3Grid;
        assert!(grid.cell_at(27.7, 85.3, 2).is_some());
        assert!(grid.cell_at(f64::NAN, 85.3, 2).is_none());
        assert!(grid.cell_at(27.7, f64::INFINITY, 2).is_none());
        assert!(grid.cell_at(27.7, 85.3, MAX_RESOLUTION + 1).is_none());
    }

    #[test]
    fn parent_is_coarser_or_none() {
        let grid = H3Grid;
        let fine = grid.cell_at(27.7, 85.3, 2).unwrap();
        let coarse = grid.parent(fine, 1).unwrap();
        assert_ne!(coarse, fine);
        assert_eq!(grid.parent(fine, 2), Some(fine));
        assert_eq!(grid.parent(coarse, 2), None);
        assert_eq!(grid.parent(fine, 16), None);
    }

    #[test]
    fn hexagon_rings_have_six_k_members() {
        let grid = H3Grid;
        let center = grid.cell_at(27.7, 85.3, 5).unwrap();
        assert_eq!(grid.ring(center, 0), vec![center]);

        let first = grid.ring(center, 1);
        let second = grid.ring(center, 2);
        assert_eq!(first.len(), 6);
        assert_eq!(second.len(), 12);
        assert!(!first.contains(&center));
        assert!(second.iter().all(|c| !first.contains(c) && *c != center));
        assert!(second.windows(2).all(|w| w[0] < w[1]));
    }
}
