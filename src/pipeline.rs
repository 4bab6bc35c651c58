//! Catalog fusion into a normalized, spatially blocked training table.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{catalog_from_table, CatalogError, EventRecord, REQUIRED_COLUMNS};
use crate::dedup::{deduplicate, DedupReport, MatchRecord};
use crate::grid::H3Grid;
use crate::normalize::{
    apply, ColumnTransformer, FitReport, NormalizationSpec, SpecError, TransformerConfig,
};
use crate::regions::{assign_regions, RegionConfig, RegionError, RegionReport};
use crate::stats::Sample;
use crate::table::{Cell, Table, TableError};

pub const EVENT_ID: &str = "event_id";
pub const LABEL_KEY: &str = "key";
pub const REGION_ID: &str = "region_id";
pub const FOLD_ID: &str = "fold_id";

const METERS_PER_KM: f64 = 1_000.0;
const RENAMED_METADATA_SUFFIX: &str = "_catalog";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub time_min_ms: Option<i64>,
    pub time_max_ms: Option<i64>,
    pub with_label_key: bool,
    pub uncertainty_trim_percentile: f64,
    pub regions: RegionConfig,
    pub transformer: TransformerConfig,
    pub meta_columns: Vec<String>,
    pub excluded_columns: Vec<String>,
    pub with_event_index: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            time_min_ms: None,
            time_max_ms: None,
            with_label_key: true,
            uncertainty_trim_percentile: 90.0,
            regions: RegionConfig::default(),
            transformer: TransformerConfig::default(),
            meta_columns: [EVENT_ID, LABEL_KEY, REGION_ID, FOLD_ID]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            excluded_columns: REQUIRED_COLUMNS[..4].iter().map(|c| c.to_string()).collect(),
            with_event_index: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Spec(#[from] SpecError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub dedup: DedupReport,
    pub concatenated: u64,
    pub uncertainty_cutoff_m: Option<f64>,
    pub trimmed: u64,
    pub out_of_time_range: u64,
    pub renamed_metadata: BTreeMap<String, String>,
    pub output_rows: u64,
    pub regions: RegionReport,
    pub fit: FitReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub features: Table,
    pub matches: Vec<MatchRecord>,
    pub spec: NormalizationSpec,
    pub report: PipelineReport,
}

pub fn build_from_tables(
    source: &Table,
    target: &Table,
    cfg: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let source = catalog_from_table(source)?;
    let target = catalog_from_table(target)?;
    build(&source, &target, cfg)
}

pub fn build(
    source: &[EventRecord],
    target: &[EventRecord],
    cfg: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let mut report = PipelineReport::default();

    let deduped = deduplicate(source, target);
    report.dedup = deduped.report;

    let mut events = deduped.source;
    events.extend(deduped.target);
    report.concatenated = events.len() as u64;

    let cutoff = Sample::finite(events.iter().map(|e| e.spatial_uncertainty))
        .percentile(cfg.uncertainty_trim_percentile);
    report.uncertainty_cutoff_m = cutoff;
    let before_trim = events.len();
    events.retain(|e| cutoff.is_some_and(|c| e.spatial_uncertainty <= c));
    report.trimmed = (before_trim - events.len()) as u64;
    for event in &mut events {
        event.spatial_uncertainty /= METERS_PER_KM;
    }

    let before_filter = events.len();
    events.retain(|e| within_time_range(e, cfg));
    report.out_of_time_range = (before_filter - events.len()) as u64;

    let blocks = assign_regions(&H3Grid, &events, &cfg.regions)?;
    report.regions = blocks.report;

    let metadata_keys: BTreeSet<&str> = events
        .iter()
        .flat_map(|e| e.metadata.keys().map(String::as_str))
        .collect();
    let added = added_columns(cfg);
    let mut taken: BTreeSet<String> = metadata_keys.iter().map(|k| k.to_string()).collect();
    taken.extend(added.iter().map(|c| c.to_string()));

    let mut metadata_columns: Vec<(&str, String)> = Vec::with_capacity(metadata_keys.len());
    for &key in &metadata_keys {
        if !added.iter().any(|c| *c == key) {
            metadata_columns.push((key, key.to_string()));
            continue;
        }
        let renamed = free_column_name(key, &taken);
        warn!(
            component = "pipeline",
            event = "pipeline.metadata.renamed",
            column = %key,
            renamed = %renamed
        );
        taken.insert(renamed.clone());
        report.renamed_metadata.insert(key.to_string(), renamed.clone());
        metadata_columns.push((key, renamed));
    }

    let mut columns = Vec::new();
    if cfg.with_event_index {
        columns.push(EVENT_ID.to_string());
    }
    columns.extend(REQUIRED_COLUMNS.iter().map(|c| c.to_string()));
    columns.extend(metadata_columns.iter().map(|(_, name)| name.clone()));
    if cfg.with_label_key {
        columns.push(LABEL_KEY.to_string());
    }
    columns.push(REGION_ID.to_string());
    columns.push(FOLD_ID.to_string());

    let mut table = Table::new(columns)?;
    for (event_id, (event, assignment)) in events.iter().zip(&blocks.assignments).enumerate() {
        let mut row = Vec::with_capacity(table.columns().len());
        if cfg.with_event_index {
            row.push(Cell::Int(event_id as i64));
        }
        row.push(Cell::Int(event.time_start_ms));
        row.push(Cell::Int(event.time_end_ms));
        row.push(Cell::Float(event.latitude_center));
        row.push(Cell::Float(event.longitude_center));
        row.push(Cell::Float(event.spatial_uncertainty));
        for (key, _) in &metadata_columns {
            row.push(event.metadata.get(*key).cloned().unwrap_or(Cell::Missing));
        }
        if cfg.with_label_key {
            row.push(Cell::Float(1.0));
        }
        row.push(Cell::Text(assignment.region_id.to_string()));
        row.push(Cell::Text(assignment.fold_id.to_string()));
        table.push_row(row)?;
    }

    let transformer = ColumnTransformer::new(cfg.transformer.clone());
    let (spec, fit) =
        transformer.fit_with_report(&table, &cfg.meta_columns, &cfg.excluded_columns);
    let features = apply(&table, &spec);
    report.fit = fit;
    report.output_rows = features.len() as u64;

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        source_events = source.len(),
        target_events = target.len(),
        matches = deduped.matches.len(),
        trimmed = report.trimmed,
        out_of_time_range = report.out_of_time_range,
        output_rows = report.output_rows,
        columns = features.columns().len()
    );

    Ok(PipelineOutput {
        features,
        matches: deduped.matches,
        spec,
        report,
    })
}

fn added_columns(cfg: &PipelineConfig) -> Vec<&'static str> {
    let mut added = Vec::with_capacity(4);
    if cfg.with_event_index {
        added.push(EVENT_ID);
    }
    if cfg.with_label_key {
        added.push(LABEL_KEY);
    }
    added.push(REGION_ID);
    added.push(FOLD_ID);
    added
}

fn free_column_name(name: &str, taken: &BTreeSet<String>) -> String {
    let base = format!("{name}{RENAMED_METADATA_SUFFIX}");
    let mut candidate = base.clone();
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    candidate
}

fn within_time_range(event: &EventRecord, cfg: &PipelineConfig) -> bool {
    let after_min = cfg.time_min_ms.map_or(true, |min| event.time_start_ms >= min);
    let before_max = cfg.time_max_ms.map_or(true, |max| event.time_end_ms <= max);
    after_min && before_max
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    fn cluster(n: usize, lat: f64, lon: f64, radius_m: f64) -> Vec<EventRecord> {
        (0..n)
            .map(|i| {
                let start = 1_700_000_000_000 + i as i64 * 7 * DAY_MS;
                EventRecord::new(
                    start,
                    start + 3_600_000,
                    lat + i as f64 * 1e-3,
                    lon,
                    radius_m + i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn default_config_marks_identity_columns() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.meta_columns, ["event_id", "key", "region_id", "fold_id"]);
        assert_eq!(
            cfg.excluded_columns,
            ["time_start", "time_end", "latitude_center", "longitude_center"]
        );
        assert_eq!(cfg.uncertainty_trim_percentile, 90.0);
    }

    #[test]
    fn time_range_is_inclusive_on_both_ends() {
        let event = EventRecord::new(100, 200, 0.0, 0.0, 1.0);
        let cfg = PipelineConfig {
            time_min_ms: Some(100),
            time_max_ms: Some(200),
            ..PipelineConfig::default()
        };
        assert!(within_time_range(&event, &cfg));
        let cfg = PipelineConfig {
            time_min_ms: Some(101),
            ..PipelineConfig::default()
        };
        assert!(!within_time_range(&event, &cfg));
    }

    #[test]
    fn trims_uncertainty_tail_and_rescales_to_km() {
        let source = cluster(20, 10.0, 10.0, 1_000.0);
        let out = build(&source, &[], &PipelineConfig::default()).unwrap();

        // 90th percentile of 1000..=1019 is 1017.1, so two rows go.
        assert_eq!(out.report.trimmed, 2);
        assert_eq!(out.features.len(), 18);
        assert!(out.matches.is_empty());
        assert_eq!(
            out.features.columns(),
            [
                "event_id",
                "time_start",
                "time_end",
                "latitude_center",
                "longitude_center",
                "spatial_uncertainty",
                "key",
                "region_id",
                "fold_id"
            ]
        );
        assert_eq!(out.features.cell(0, "event_id"), Some(&Cell::Int(0)));
        assert_eq!(out.features.cell(0, "key"), Some(&Cell::Float(1.0)));
        assert_eq!(
            out.features.cell(0, "time_start"),
            Some(&Cell::Int(source[0].time_start_ms))
        );
    }
}
