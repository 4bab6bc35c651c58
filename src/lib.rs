//! Landslide catalog fusion core.
//!
//! - cross-catalog duplicate resolution with a match audit
//! - hierarchical spatial region/fold blocking for cross-validation
//! - adaptive, replayable per-column normalization with a persisted spec
//! - a thin pipeline sequencing the three into a training table

mod catalog;
mod dedup;
mod geo;
mod grid;
mod normalize;
mod observability;
mod pipeline;
mod regions;
mod stats;
mod table;

pub use catalog::{
    catalog_from_table, utc_day, CatalogError, EventRecord, LATITUDE_CENTER, LONGITUDE_CENTER,
    REQUIRED_COLUMNS, SPATIAL_UNCERTAINTY, TIME_END, TIME_START,
};
pub use dedup::{
    deduplicate, matches_to_table, write_matches_csv, DedupOutcome, DedupReport, MatchRecord,
    MATCH_COLUMNS,
};
pub use geo::{haversine_m, EARTH_RADIUS_M};
pub use grid::{H3Grid, SpatialIndex, MAX_RESOLUTION};
pub use normalize::{
    apply, assert_spec_compatible, fit_transform, invert, severity, ColumnFit, ColumnSpec,
    ColumnTransformer, FitReport, NormalizationSpec, PipelineTemplate, PostScale, SpecError, Step,
    TransformerConfig, SPEC_VERSION,
};
pub use observability::{
    env_flag, env_string, init_logging, log_app_start, log_input_loaded, log_output_written,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError, ENV_LOG_FORMAT,
    ENV_LOG_LEVEL, ENV_LOG_TARGET,
};
pub use pipeline::{
    build, build_from_tables, PipelineConfig, PipelineError, PipelineOutput, PipelineReport,
    EVENT_ID, FOLD_ID, LABEL_KEY, REGION_ID,
};
pub use regions::{
    assign_regions, validate_region_config, RegionAssignment, RegionBlocks, RegionConfig,
    RegionError, RegionId, RegionReport, FALLBACK_SUFFIX,
};
pub use stats::Sample;
pub use table::{Cell, Table, TableError};
