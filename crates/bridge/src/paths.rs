//! Data directory layout.
//!
//! Resolved once at startup from: CLI `--data-dir` > `RELAYDOCK_DATA_DIR` env > `~/.relaydock`,
//! then passed explicitly to whatever needs it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DATA_DIR_ENV: &str = "RELAYDOCK_DATA_DIR";

pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    resolve_with(explicit, std::env::var_os(DATA_DIR_ENV), dirs::home_dir())
}

fn resolve_with(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    home: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    home.map(|h| h.join(".relaydock"))
        .context("HOME directory not found; pass --data-dir")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Create the data dir and its subdirectories.
pub fn ensure_dirs(data_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(log_dir(data_dir))?;
    Ok(())
}
