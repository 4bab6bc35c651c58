//! Shared logging configuration and initialization.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub const ENV_LOG_LEVEL: &str = "ATLAS_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "ATLAS_LOG_FORMAT";
pub const ENV_LOG_TARGET: &str = "ATLAS_LOG_TARGET";

pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_string(ENV_LOG_LEVEL).unwrap_or(defaults.level),
        format: env_string(ENV_LOG_FORMAT)
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: env_flag(ENV_LOG_TARGET).unwrap_or(defaults.include_target),
    }
}

pub fn env_string(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn env_flag(key: &str) -> Option<bool> {
    env_string(key).and_then(|raw| parse_bool(&raw))
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_input_loaded(component: &'static str, path: &Path, rows: usize) {
    info!(
        component,
        event = "input.loaded",
        path = %path.display(),
        rows
    );
}

pub fn log_output_written(component: &'static str, kind: &str, path: &Path, rows: Option<usize>) {
    match rows {
        Some(rows) => info!(
            component,
            event = "output.written",
            kind,
            path = %path.display(),
            rows
        ),
        None => info!(
            component,
            event = "output.written",
            kind,
            path = %path.display()
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(
            &[
                (ENV_LOG_LEVEL, None),
                (ENV_LOG_FORMAT, None),
                (ENV_LOG_TARGET, None),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn parses_json_and_level_and_target_from_env() {
        let cfg = with_env_vars(
            &[
                (ENV_LOG_LEVEL, Some("debug")),
                (ENV_LOG_FORMAT, Some("json")),
                (ENV_LOG_TARGET, Some("false")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn invalid_format_or_target_falls_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                (ENV_LOG_LEVEL, Some("trace")),
                (ENV_LOG_FORMAT, Some("yaml")),
                (ENV_LOG_TARGET, Some("maybe")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let cfg = with_env_vars(
            &[
                (ENV_LOG_LEVEL, Some("   ")),
                (ENV_LOG_FORMAT, Some(" JSON ")),
                (ENV_LOG_TARGET, Some("")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(cfg.include_target);
    }
}
