use std::fs::{self, File};
use std::path::PathBuf;

use atlas_features::{
    build_from_tables, env_flag, env_string, init_logging, log_app_start, log_input_loaded,
    log_output_written, logging_config_from_env, write_matches_csv, PipelineConfig, Table,
};

const COMPONENT: &str = "build_features";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let source_path = required_path("ATLAS_SOURCE_CSV")?;
    let target_path = required_path("ATLAS_TARGET_CSV")?;
    let output_dir =
        PathBuf::from(env_string("ATLAS_OUTPUT_DIR").unwrap_or_else(|| "out".to_string()));

    let cfg = PipelineConfig {
        time_min_ms: optional_ms("ATLAS_TIME_MIN_MS")?,
        time_max_ms: optional_ms("ATLAS_TIME_MAX_MS")?,
        with_label_key: env_flag("ATLAS_LABEL_KEY").unwrap_or(true),
        ..PipelineConfig::default()
    };

    let source = Table::read_csv_path(&source_path)?;
    log_input_loaded(COMPONENT, &source_path, source.len());
    let target = Table::read_csv_path(&target_path)?;
    log_input_loaded(COMPONENT, &target_path, target.len());

    let output = build_from_tables(&source, &target, &cfg)?;

    fs::create_dir_all(&output_dir)?;

    let features_path = output_dir.join("features.csv");
    output.features.write_csv_path(&features_path)?;
    log_output_written(COMPONENT, "features", &features_path, Some(output.features.len()));

    let matches_path = output_dir.join("matches.csv");
    write_matches_csv(&output.matches, File::create(&matches_path)?)?;
    log_output_written(COMPONENT, "matches", &matches_path, Some(output.matches.len()));

    let spec_path = output_dir.join("normalization_spec.json");
    output.spec.save(&spec_path)?;
    log_output_written(COMPONENT, "spec", &spec_path, None);

    println!(
        "features={} matches={} trimmed={} fingerprint={}",
        output.features.len(),
        output.matches.len(),
        output.report.trimmed,
        output.spec.fingerprint()?
    );

    Ok(())
}

fn required_path(key: &str) -> Result<PathBuf, String> {
    env_string(key)
        .map(PathBuf::from)
        .ok_or_else(|| format!("{key} must be set"))
}

fn optional_ms(key: &str) -> Result<Option<i64>, String> {
    env_string(key)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|err| format!("{key}={raw} is not an epoch millisecond value: {err}"))
        })
        .transpose()
}
