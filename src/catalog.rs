//! Schema-normalized landslide event records.

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{Cell, Table};

pub const TIME_START: &str = "time_start";
pub const TIME_END: &str = "time_end";
pub const LATITUDE_CENTER: &str = "latitude_center";
pub const LONGITUDE_CENTER: &str = "longitude_center";
pub const SPATIAL_UNCERTAINTY: &str = "spatial_uncertainty";

pub const REQUIRED_COLUMNS: [&str; 5] = [
    TIME_START,
    TIME_END,
    LATITUDE_CENTER,
    LONGITUDE_CENTER,
    SPATIAL_UNCERTAINTY,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time_start_ms: i64,
    pub time_end_ms: i64,
    pub latitude_center: f64,
    pub longitude_center: f64,
    pub spatial_uncertainty: f64,
    pub metadata: BTreeMap<String, Cell>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("catalog table is missing required column {0}")]
    MissingColumn(&'static str),
    #[error("time_start {time_start_ms} is after time_end {time_end_ms}")]
    InvertedInterval { time_start_ms: i64, time_end_ms: i64 },
    #[error("coordinate out of range: lat={latitude}, lon={longitude}")]
    CoordinateOutOfRange { latitude: f64, longitude: f64 },
    #[error("spatial uncertainty must be finite and non-negative, got {0}")]
    InvalidUncertainty(f64),
    #[error("field {field} has no usable value")]
    MissingValue { field: &'static str },
}

impl EventRecord {
    pub fn new(
        time_start_ms: i64,
        time_end_ms: i64,
        latitude_center: f64,
        longitude_center: f64,
        spatial_uncertainty: f64,
    ) -> Self {
        Self {
            time_start_ms,
            time_end_ms,
            latitude_center,
            longitude_center,
            spatial_uncertainty,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Cell>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.time_start_ms > self.time_end_ms {
            return Err(CatalogError::InvertedInterval {
                time_start_ms: self.time_start_ms,
                time_end_ms: self.time_end_ms,
            });
        }
        let lat_ok = self.latitude_center.is_finite() && self.latitude_center.abs() <= 90.0;
        let lon_ok = self.longitude_center.is_finite() && self.longitude_center.abs() <= 180.0;
        if !lat_ok || !lon_ok {
            return Err(CatalogError::CoordinateOutOfRange {
                latitude: self.latitude_center,
                longitude: self.longitude_center,
            });
        }
        if !self.spatial_uncertainty.is_finite() || self.spatial_uncertainty < 0.0 {
            return Err(CatalogError::InvalidUncertainty(self.spatial_uncertainty));
        }
        Ok(())
    }

    pub fn start_day(&self) -> NaiveDate {
        utc_day(self.time_start_ms)
    }

    pub fn end_day(&self) -> NaiveDate {
        utc_day(self.time_end_ms)
    }
}

pub fn utc_day(ts_ms_utc: i64) -> NaiveDate {
    match Utc.timestamp_millis_opt(ts_ms_utc).single() {
        Some(dt) => dt.date_naive(),
        None if ts_ms_utc < 0 => NaiveDate::MIN,
        None => NaiveDate::MAX,
    }
}

pub fn catalog_from_table(table: &Table) -> Result<Vec<EventRecord>, CatalogError> {
    let mut idx = [0usize; REQUIRED_COLUMNS.len()];
    for (slot, name) in idx.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = table
            .column_index(name)
            .ok_or(CatalogError::MissingColumn(name))?;
    }

    let mut events = Vec::with_capacity(table.len());
    let mut rejected = 0usize;
    for (row_idx, row) in table.rows().iter().enumerate() {
        let parsed = parse_event_row(table.columns(), row, idx);
        match parsed {
            Ok(event) => events.push(event),
            Err(err) => {
                rejected += 1;
                warn!(
                    component = "catalog",
                    event = "catalog.row.rejected",
                    row = row_idx,
                    reason = %err
                );
            }
        }
    }

    info!(
        component = "catalog",
        event = "catalog.loaded",
        rows = table.len(),
        accepted = events.len(),
        rejected
    );

    Ok(events)
}

fn parse_event_row(
    columns: &[String],
    row: &[Cell],
    idx: [usize; REQUIRED_COLUMNS.len()],
) -> Result<EventRecord, CatalogError> {
    let [start_idx, end_idx, lat_idx, lon_idx, unc_idx] = idx;
    let event = EventRecord {
        time_start_ms: timestamp_ms(&row[start_idx], TIME_START)?,
        time_end_ms: timestamp_ms(&row[end_idx], TIME_END)?,
        latitude_center: number(&row[lat_idx], LATITUDE_CENTER)?,
        longitude_center: number(&row[lon_idx], LONGITUDE_CENTER)?,
        spatial_uncertainty: number(&row[unc_idx], SPATIAL_UNCERTAINTY)?,
        metadata: columns
            .iter()
            .zip(row)
            .filter(|(name, _)| !REQUIRED_COLUMNS.contains(&name.as_str()))
            .map(|(name, cell)| (name.clone(), cell.clone()))
            .collect(),
    };
    event.validate()?;
    Ok(event)
}

fn timestamp_ms(cell: &Cell, field: &'static str) -> Result<i64, CatalogError> {
    match cell {
        Cell::Int(v) => Ok(*v),
        Cell::Float(v) if v.is_finite() => Ok(v.round() as i64),
        _ => Err(CatalogError::MissingValue { field }),
    }
}

fn number(cell: &Cell, field: &'static str) -> Result<f64, CatalogError> {
    cell.as_f64()
        .filter(|v| v.is_finite())
        .ok_or(CatalogError::MissingValue { field })
}
