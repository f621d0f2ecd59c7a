use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Centralized path management for gdpm

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
}

/// Directory holding `config.json`
pub fn gdpm_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("gdpm")
}

/// Get the gdpm data directory, creating it if needed
pub fn gdpm_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| home_dir().join(".local/share"))
        .join("gdpm");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory at {}", data_dir.display()))?;

    Ok(data_dir)
}

pub fn default_config_path() -> PathBuf {
    gdpm_config_dir().join("config.json")
}

pub fn default_packages_dir() -> PathBuf {
    home_dir().join(".gdpm")
}

pub fn default_tmp_dir() -> PathBuf {
    default_packages_dir().join("tmp")
}

pub fn log_file_path() -> Result<PathBuf> {
    Ok(gdpm_data_dir()?.join("gdpm.log"))
}

/// SQLite index of installed packages, kept next to the packages themselves
pub fn database_path(packages_dir: &Path) -> PathBuf {
    packages_dir.join("cache.db")
}

/// Expand a leading `~` and environment variables
pub fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

/// Turn a package title into a single safe path component
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
