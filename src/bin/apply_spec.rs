use std::path::PathBuf;

use atlas_features::{
    apply, assert_spec_compatible, env_flag, env_string, init_logging, invert, log_app_start,
    log_input_loaded, log_output_written, logging_config_from_env, NormalizationSpec, Table,
    SPEC_VERSION,
};

const COMPONENT: &str = "apply_spec";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let spec_path = required_path("ATLAS_SPEC_PATH")?;
    let input_path = required_path("ATLAS_INPUT_CSV")?;
    let output_path = required_path("ATLAS_OUTPUT_CSV")?;
    let inverse = env_flag("ATLAS_INVERT").unwrap_or(false);

    let spec = NormalizationSpec::load(&spec_path)?;
    if let Some(expected) = env_string("ATLAS_SPEC_FINGERPRINT") {
        assert_spec_compatible(SPEC_VERSION, &expected, &spec)?;
    }

    let input = Table::read_csv_path(&input_path)?;
    log_input_loaded(COMPONENT, &input_path, input.len());

    let output = if inverse {
        invert(&input, &spec)
    } else {
        apply(&input, &spec)
    };
    output.write_csv_path(&output_path)?;
    log_output_written(
        COMPONENT,
        if inverse { "inverted" } else { "applied" },
        &output_path,
        Some(output.len()),
    );

    Ok(())
}

fn required_path(key: &str) -> Result<PathBuf, String> {
    env_string(key)
        .map(PathBuf::from)
        .ok_or_else(|| format!("{key} must be set"))
}
