//! Cross-catalog duplicate resolution.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::EventRecord;
use crate::geo::haversine_m;
use crate::table::{Cell, Table, TableError};

pub const MATCH_COLUMNS: [&str; 10] = [
    "source_id",
    "target_id",
    "date",
    "distance_m",
    "source_radius_m",
    "target_radius_m",
    "time_start_source",
    "time_end_source",
    "time_start_target",
    "time_end_target",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub source_id: usize,
    pub target_id: usize,
    pub date: NaiveDate,
    pub distance_m: f64,
    pub source_radius_m: f64,
    pub target_radius_m: f64,
    pub source_time_start_ms: i64,
    pub source_time_end_ms: i64,
    pub target_time_start_ms: i64,
    pub target_time_end_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub day_candidates: u64,
    pub overlapping: u64,
    pub proximate: u64,
    pub matched_sources: u64,
    pub removed_targets: u64,
    pub lowered_uncertainty: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub source: Vec<EventRecord>,
    pub target: Vec<EventRecord>,
    pub matches: Vec<MatchRecord>,
    pub report: DedupReport,
}

#[derive(Debug, Clone)]
struct Candidate {
    source_id: usize,
    target_id: usize,
    date: NaiveDate,
    distance_m: f64,
}

pub fn deduplicate(source: &[EventRecord], target: &[EventRecord]) -> DedupOutcome {
    let mut report = DedupReport::default();

    let mut targets_by_day: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (target_id, event) in target.iter().enumerate() {
        targets_by_day
            .entry(event.start_day())
            .or_default()
            .push(target_id);
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (source_id, event) in source.iter().enumerate() {
        for day in day_keys(event) {
            let Some(target_ids) = targets_by_day.get(&day) else {
                continue;
            };
            for &target_id in target_ids {
                // A pair reachable through both day keys keeps its first key.
                if seen.insert((source_id, target_id)) {
                    candidates.push(Candidate {
                        source_id,
                        target_id,
                        date: day,
                        distance_m: f64::NAN,
                    });
                }
            }
        }
    }
    report.day_candidates = candidates.len() as u64;

    candidates.retain(|c| intervals_overlap(&source[c.source_id], &target[c.target_id]));
    report.overlapping = candidates.len() as u64;
    if candidates.is_empty() {
        return unchanged(source, target, report);
    }

    for candidate in &mut candidates {
        let s = &source[candidate.source_id];
        let t = &target[candidate.target_id];
        candidate.distance_m = haversine_m(
            s.latitude_center,
            s.longitude_center,
            t.latitude_center,
            t.longitude_center,
        );
    }
    candidates.retain(|c| {
        let threshold_m =
            source[c.source_id].spatial_uncertainty + target[c.target_id].spatial_uncertainty;
        c.distance_m <= threshold_m
    });
    report.proximate = candidates.len() as u64;
    if candidates.is_empty() {
        return unchanged(source, target, report);
    }

    candidates.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| best_match_order(a, b, target))
    });

    let mut best: Vec<&Candidate> = Vec::new();
    for candidate in &candidates {
        if best.last().map(|c| c.source_id) != Some(candidate.source_id) {
            best.push(candidate);
        }
    }
    report.matched_sources = best.len() as u64;

    let mut updated_source = source.to_vec();
    let mut matched_targets = HashSet::new();
    let mut matches = Vec::with_capacity(best.len());
    for candidate in best {
        let s = &source[candidate.source_id];
        let t = &target[candidate.target_id];
        if t.spatial_uncertainty < s.spatial_uncertainty {
            updated_source[candidate.source_id].spatial_uncertainty = t.spatial_uncertainty;
            report.lowered_uncertainty += 1;
        }
        matched_targets.insert(candidate.target_id);
        matches.push(MatchRecord {
            source_id: candidate.source_id,
            target_id: candidate.target_id,
            date: candidate.date,
            distance_m: candidate.distance_m,
            source_radius_m: s.spatial_uncertainty,
            target_radius_m: t.spatial_uncertainty,
            source_time_start_ms: s.time_start_ms,
            source_time_end_ms: s.time_end_ms,
            target_time_start_ms: t.time_start_ms,
            target_time_end_ms: t.time_end_ms,
        });
    }

    let reduced_target: Vec<EventRecord> = target
        .iter()
        .enumerate()
        .filter(|(target_id, _)| !matched_targets.contains(target_id))
        .map(|(_, event)| event.clone())
        .collect();
    report.removed_targets = matched_targets.len() as u64;

    if report.removed_targets < report.matched_sources {
        debug!(
            component = "dedup",
            event = "dedup.shared_targets",
            matched_sources = report.matched_sources,
            removed_targets = report.removed_targets
        );
    }
    log_finish(source.len(), target.len(), &report);

    DedupOutcome {
        source: updated_source,
        target: reduced_target,
        matches,
        report,
    }
}

// Start day, plus the end day when the window crosses midnight UTC.
fn day_keys(event: &EventRecord) -> Vec<NaiveDate> {
    let start = event.start_day();
    let end = event.end_day();
    if end != start {
        vec![start, end]
    } else {
        vec![start]
    }
}

fn intervals_overlap(a: &EventRecord, b: &EventRecord) -> bool {
    a.time_start_ms <= b.time_end_ms && b.time_start_ms <= a.time_end_ms
}

fn best_match_order(a: &Candidate, b: &Candidate, target: &[EventRecord]) -> Ordering {
    let ta = &target[a.target_id];
    let tb = &target[b.target_id];
    a.distance_m
        .total_cmp(&b.distance_m)
        .then_with(|| ta.spatial_uncertainty.total_cmp(&tb.spatial_uncertainty))
        .then_with(|| ta.time_start_ms.cmp(&tb.time_start_ms))
        .then_with(|| a.target_id.cmp(&b.target_id))
}

fn unchanged(source: &[EventRecord], target: &[EventRecord], report: DedupReport) -> DedupOutcome {
    log_finish(source.len(), target.len(), &report);
    DedupOutcome {
        source: source.to_vec(),
        target: target.to_vec(),
        matches: Vec::new(),
        report,
    }
}

fn log_finish(source_rows: usize, target_rows: usize, report: &DedupReport) {
    info!(
        component = "dedup",
        event = "dedup.finish",
        source_rows,
        target_rows,
        day_candidates = report.day_candidates,
        overlapping = report.overlapping,
        proximate = report.proximate,
        matched_sources = report.matched_sources,
        removed_targets = report.removed_targets,
        lowered_uncertainty = report.lowered_uncertainty
    );
}

pub fn matches_to_table(matches: &[MatchRecord]) -> Table {
    let rows = matches
        .iter()
        .map(|m| {
            vec![
                Cell::Int(m.source_id as i64),
                Cell::Int(m.target_id as i64),
                Cell::Text(m.date.format("%Y-%m-%d").to_string()),
                Cell::Float(m.distance_m),
                Cell::Float(m.source_radius_m),
                Cell::Float(m.target_radius_m),
                rfc3339_cell(m.source_time_start_ms),
                rfc3339_cell(m.source_time_end_ms),
                rfc3339_cell(m.target_time_start_ms),
                rfc3339_cell(m.target_time_end_ms),
            ]
        })
        .collect();
    let columns = MATCH_COLUMNS.iter().map(|c| c.to_string()).collect();
    Table::from_parts(columns, rows)
}

pub fn write_matches_csv<W: std::io::Write>(
    matches: &[MatchRecord],
    writer: W,
) -> Result<(), TableError> {
    matches_to_table(matches).write_csv(writer)
}

fn rfc3339_cell(ts_ms_utc: i64) -> Cell {
    match Utc.timestamp_millis_opt(ts_ms_utc).single() {
        Some(dt) => Cell::Text(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => Cell::Int(ts_ms_utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;
    const JAN_1_2024: i64 = 1_704_067_200_000;

    #[test]
    fn day_keys_cover_start_and_end_day_once() {
        let same_day = EventRecord::new(JAN_1_2024, JAN_1_2024 + 3_600_000, 0.0, 0.0, 1.0);
        assert_eq!(day_keys(&same_day).len(), 1);

        let spans = EventRecord::new(
            JAN_1_2024 + 12 * 3_600_000,
            JAN_1_2024 + DAY_MS + 1,
            0.0,
            0.0,
            1.0,
        );
        let keys = day_keys(&spans);
        assert_eq!(keys.len(), 2);
        assert!(keys[0] < keys[1]);
    }

    #[test]
    fn pair_reached_through_both_days_is_joined_once() {
        // Source spans Jan 1 to Jan 2; target starts Jan 1 and also overlaps Jan 2.
        let source = vec![EventRecord::new(
            JAN_1_2024 + 1,
            JAN_1_2024 + DAY_MS + 1,
            10.0,
            10.0,
            100.0,
        )];
        let target = vec![EventRecord::new(
            JAN_1_2024,
            JAN_1_2024 + DAY_MS,
            10.0,
            10.0,
            100.0,
        )];
        let out = deduplicate(&source, &target);
        assert_eq!(out.report.day_candidates, 1);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn match_table_has_audit_columns() {
        let m = MatchRecord {
            source_id: 3,
            target_id: 7,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            distance_m: 50.0,
            source_radius_m: 100.0,
            target_radius_m: 80.0,
            source_time_start_ms: JAN_1_2024,
            source_time_end_ms: JAN_1_2024,
            target_time_start_ms: JAN_1_2024,
            target_time_end_ms: JAN_1_2024 + DAY_MS,
        };
        let table = matches_to_table(&[m]);
        assert_eq!(table.columns().len(), MATCH_COLUMNS.len());
        assert_eq!(table.cell(0, "date"), Some(&Cell::Text("2024-01-01".to_string())));
        assert_eq!(
            table.cell(0, "time_end_target"),
            Some(&Cell::Text("2024-01-02T00:00:00.000Z".to_string()))
        );

        let empty = matches_to_table(&[]);
        assert!(empty.is_empty());
        assert_eq!(empty.columns().len(), MATCH_COLUMNS.len());
    }
}
