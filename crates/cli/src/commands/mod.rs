//! Subcommand implementations.

pub mod config_cmd;
pub mod identify;
pub mod migrate;
pub mod serve;

use identra_config::{AppConfig, ConfigError};
use identra_core::Error;
use std::path::{Path, PathBuf};

/// The config file in use: `--config` if given, else the default location.
pub fn config_file(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Load the effective configuration, environment overrides applied.
///
/// A missing default file means defaults; a missing `--config` file is an
/// error.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Error> {
    let result = match path {
        Some(p) if !p.exists() => Err(ConfigError::ReadError {
            path: p.to_path_buf(),
            reason: "file does not exist".into(),
        }),
        Some(p) => AppConfig::load_with_env(p),
        None => AppConfig::load(),
    };
    result.map_err(|e| Error::Config {
        message: e.to_string(),
    })
}
