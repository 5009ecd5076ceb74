//! Subscriber setup for the `fixtures` binary

use clap::ValueEnum;
use fixture_config::parser;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable
    Text,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber. Level precedence: `RUST_LOG`, then
/// `--verbose`, then `settings.log_level` of the config, then `info`.
/// Logs go to stderr; stdout is left for command output.
pub fn init(verbose: bool, format: LogFormat, config_path: &Path) {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        configured_level(config_path).unwrap_or_else(|| "info".to_string())
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

// Config errors are reported by the command itself
fn configured_level(config_path: &Path) -> Option<String> {
    parser::parse_file(config_path).ok()?.settings.log_level
}
