//! Region and fold assignment for spatially blocked cross-validation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::EventRecord;
use crate::grid::{SpatialIndex, MAX_RESOLUTION};

pub const FALLBACK_SUFFIX: &str = "-OTHER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub fine_resolution: u8,
    pub coarse_resolution: u8,
    pub min_support: usize,
    pub max_ring_search: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            fine_resolution: 2,
            coarse_resolution: 1,
            min_support: 13,
            max_ring_search: 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("resolution {resolution} exceeds the maximum of {max}")]
    ResolutionTooFine { resolution: u8, max: u8 },
    #[error("coarse resolution {coarse} must not be finer than fine resolution {fine}")]
    CoarseFinerThanFine { fine: u8, coarse: u8 },
    #[error("event {index} has no cell at its coordinates")]
    InvalidCoordinate { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegionId<C> {
    Cell(C),
    Fallback { fold: C },
}

impl<C> RegionId<C> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

impl<C: fmt::Display> fmt::Display for RegionId<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cell(cell) => write!(f, "{cell}"),
            Self::Fallback { fold } => write!(f, "{fold}{FALLBACK_SUFFIX}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAssignment<C> {
    pub region_id: RegionId<C>,
    pub fold_id: C,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionReport {
    pub natural_regions: u64,
    pub undersized_regions: u64,
    pub merged_into_neighbor: u64,
    pub merged_into_fallback: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionBlocks<C> {
    pub assignments: Vec<RegionAssignment<C>>,
    pub report: RegionReport,
}

pub fn validate_region_config(cfg: &RegionConfig) -> Result<(), RegionError> {
    for resolution in [cfg.fine_resolution, cfg.coarse_resolution] {
        if resolution > MAX_RESOLUTION {
            return Err(RegionError::ResolutionTooFine {
                resolution,
                max: MAX_RESOLUTION,
            });
        }
    }
    if cfg.coarse_resolution > cfg.fine_resolution {
        return Err(RegionError::CoarseFinerThanFine {
            fine: cfg.fine_resolution,
            coarse: cfg.coarse_resolution,
        });
    }
    Ok(())
}

pub fn assign_regions<I: SpatialIndex>(
    index: &I,
    events: &[EventRecord],
    cfg: &RegionConfig,
) -> Result<RegionBlocks<I::Cell>, RegionError> {
    validate_region_config(cfg)?;

    let mut natural = Vec::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        let region = index
            .cell_at(
                event.latitude_center,
                event.longitude_center,
                cfg.fine_resolution,
            )
            .ok_or(RegionError::InvalidCoordinate { index: i })?;
        let fold = index
            .parent(region, cfg.coarse_resolution)
            .ok_or(RegionError::CoarseFinerThanFine {
                fine: cfg.fine_resolution,
                coarse: cfg.coarse_resolution,
            })?;
        natural.push((fold, region));
    }

    let mut counts: BTreeMap<(I::Cell, I::Cell), usize> = BTreeMap::new();
    let mut fold_regions: BTreeMap<I::Cell, BTreeSet<I::Cell>> = BTreeMap::new();
    for &(fold, region) in &natural {
        *counts.entry((fold, region)).or_default() += 1;
        fold_regions.entry(fold).or_default().insert(region);
    }

    let mut report = RegionReport {
        natural_regions: counts.len() as u64,
        ..RegionReport::default()
    };

    let mut replacements: BTreeMap<(I::Cell, I::Cell), RegionId<I::Cell>> = BTreeMap::new();
    for (&(fold, region), &count) in &counts {
        if count >= cfg.min_support {
            continue;
        }
        report.undersized_regions += 1;

        let neighbor = search_supported_neighbor(index, fold, region, &counts, &fold_regions, cfg);
        let replacement = match neighbor {
            Some(cell) => {
                report.merged_into_neighbor += 1;
                debug!(
                    component = "regions",
                    event = "regions.merge.neighbor",
                    fold_id = %fold,
                    region_id = %region,
                    count,
                    neighbor = %cell
                );
                RegionId::Cell(cell)
            }
            None => {
                report.merged_into_fallback += 1;
                debug!(
                    component = "regions",
                    event = "regions.merge.fallback",
                    fold_id = %fold,
                    region_id = %region,
                    count
                );
                RegionId::Fallback { fold }
            }
        };
        replacements.insert((fold, region), replacement);
    }

    let assignments = natural
        .into_iter()
        .map(|(fold, region)| RegionAssignment {
            region_id: replacements
                .get(&(fold, region))
                .copied()
                .unwrap_or(RegionId::Cell(region)),
            fold_id: fold,
        })
        .collect();

    info!(
        component = "regions",
        event = "regions.assigned",
        events = events.len(),
        folds = fold_regions.len(),
        natural_regions = report.natural_regions,
        undersized_regions = report.undersized_regions,
        merged_into_neighbor = report.merged_into_neighbor,
        merged_into_fallback = report.merged_into_fallback
    );

    Ok(RegionBlocks {
        assignments,
        report,
    })
}

fn search_supported_neighbor<I: SpatialIndex>(
    index: &I,
    fold: I::Cell,
    region: I::Cell,
    counts: &BTreeMap<(I::Cell, I::Cell), usize>,
    fold_regions: &BTreeMap<I::Cell, BTreeSet<I::Cell>>,
    cfg: &RegionConfig,
) -> Option<I::Cell> {
    let observed = fold_regions.get(&fold)?;
    for k in 1..=cfg.max_ring_search {
        for neighbor in index.ring(region, k) {
            if neighbor == region || !observed.contains(&neighbor) {
                continue;
            }
            let supported = counts
                .get(&(fold, neighbor))
                .is_some_and(|count| *count >= cfg.min_support);
            if supported {
                return Some(neighbor);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::H3Grid;

    // Longitude bands: resolution r splits the globe into 2^r columns.
    struct Bands;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    struct Band {
        resolution: u8,
        col: i64,
    }

    impl fmt::Display for Band {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "b{}c{}", self.resolution, self.col)
        }
    }

    impl SpatialIndex for Bands {
        type Cell = Band;

        fn cell_at(&self, _latitude: f64, longitude: f64, resolution: u8) -> Option<Band> {
            if !longitude.is_finite() {
                return None;
            }
            let n = 1_i64 << resolution;
            let col = (((longitude + 180.0) / 360.0) * n as f64).floor() as i64;
            Some(Band {
                resolution,
                col: col.clamp(0, n - 1),
            })
        }

        fn parent(&self, cell: Band, resolution: u8) -> Option<Band> {
            (resolution <= cell.resolution).then(|| Band {
                resolution,
                col: cell.col >> (cell.resolution - resolution),
            })
        }

        fn ring(&self, cell: Band, k: u32) -> Vec<Band> {
            let n = 1_i64 << cell.resolution;
            [cell.col - i64::from(k), cell.col + i64::from(k)]
                .into_iter()
                .filter(|col| (0..n).contains(col))
                .map(|col| Band {
                    resolution: cell.resolution,
                    col,
                })
                .collect()
        }
    }

    fn event_at(lon: f64) -> EventRecord {
        EventRecord::new(0, 0, 0.0, lon, 100.0)
    }

    // Res 4 columns are 22.5 degrees wide; res 2 folds are 90 degrees wide.
    fn band_config(min_support: usize, max_ring_search: u32) -> RegionConfig {
        RegionConfig {
            fine_resolution: 4,
            coarse_resolution: 2,
            min_support,
            max_ring_search,
        }
    }

    #[test]
    fn config_rejects_inverted_resolutions() {
        let cfg = RegionConfig {
            fine_resolution: 3,
            coarse_resolution: 4,
            ..RegionConfig::default()
        };
        assert_eq!(
            validate_region_config(&cfg),
            Err(RegionError::CoarseFinerThanFine { fine: 3, coarse: 4 })
        );

        let cfg = RegionConfig {
            fine_resolution: 30,
            ..RegionConfig::default()
        };
        assert!(matches!(
            validate_region_config(&cfg),
            Err(RegionError::ResolutionTooFine { resolution: 30, .. })
        ));
    }

    #[test]
    fn fallback_text_is_scoped_to_fold() {
        let fold_a = Band { resolution: 2, col: 1 };
        let fold_b = Band { resolution: 2, col: 2 };
        let a = RegionId::Fallback { fold: fold_a };
        let b = RegionId::Fallback { fold: fold_b };
        assert_eq!(a.to_string(), "b2c1-OTHER");
        assert_ne!(a.to_string(), b.to_string());
        assert!(a.is_fallback());
        assert!(!RegionId::Cell(fold_a).is_fallback());
    }

    #[test]
    fn sparse_region_merges_into_supported_neighbor() {
        // Columns 8 and 9 share fold 2.
        let events = vec![event_at(1.0), event_at(2.0), event_at(3.0), event_at(23.0)];

        let blocks = assign_regions(&Bands, &events, &band_config(3, 1)).unwrap();
        let dense = blocks.assignments[0].region_id;
        assert_eq!(dense, RegionId::Cell(Band { resolution: 4, col: 8 }));
        assert_eq!(blocks.assignments[3].region_id, dense);
        assert_eq!(blocks.assignments[3].fold_id, blocks.assignments[0].fold_id);
        assert_eq!(blocks.report.merged_into_neighbor, 1);
        assert_eq!(blocks.report.merged_into_fallback, 0);
    }

    #[test]
    fn search_reaches_outer_rings_up_to_the_limit() {
        // Column 8 is alone; column 10 is two steps east in the same fold.
        let events = vec![event_at(1.0), event_at(46.0), event_at(47.0), event_at(48.0)];

        let near = assign_regions(&Bands, &events, &band_config(3, 1)).unwrap();
        assert!(near.assignments[0].region_id.is_fallback());

        let far = assign_regions(&Bands, &events, &band_config(3, 2)).unwrap();
        assert_eq!(
            far.assignments[0].region_id,
            RegionId::Cell(Band { resolution: 4, col: 10 })
        );
    }

    #[test]
    fn supported_neighbor_in_another_fold_is_ignored() {
        // Column 7 belongs to fold 1, column 8 to fold 2.
        let events = vec![event_at(-22.0), event_at(-21.0), event_at(-20.0), event_at(1.0)];

        let blocks = assign_regions(&Bands, &events, &band_config(3, 3)).unwrap();
        let fold = Band { resolution: 2, col: 2 };
        assert_eq!(blocks.assignments[3].fold_id, fold);
        assert_eq!(blocks.assignments[3].region_id, RegionId::Fallback { fold });
        assert_eq!(blocks.report.merged_into_fallback, 1);
    }

    #[test]
    fn region_without_supported_neighbor_gets_fold_fallback() {
        let grid = H3Grid;
        let cfg = RegionConfig {
            min_support: 2,
            ..RegionConfig::default()
        };
        let events = vec![
            EventRecord::new(0, 0, 40.0, -100.0, 1.0),
            EventRecord::new(0, 0, -40.0, 100.0, 1.0),
        ];

        let blocks = assign_regions(&grid, &events, &cfg).unwrap();
        for (event, assignment) in events.iter().zip(&blocks.assignments) {
            let fine = grid
                .cell_at(event.latitude_center, event.longitude_center, 2)
                .unwrap();
            let fold = grid.parent(fine, 1).unwrap();
            assert_eq!(assignment.fold_id, fold);
            assert_eq!(assignment.region_id, RegionId::Fallback { fold });
        }
        assert_eq!(blocks.report.merged_into_fallback, 2);
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let events = vec![
            EventRecord::new(0, 0, 10.0, 10.0, 1.0),
            EventRecord::new(0, 0, f64::NAN, 10.0, 1.0),
        ];
        let err = assign_regions(&H3Grid, &events, &RegionConfig::default()).unwrap_err();
        assert_eq!(err, RegionError::InvalidCoordinate { index: 1 });
    }
}
