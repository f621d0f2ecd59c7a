//! Persisted settings: paths, credentials, concurrency, timeouts, feature flags
//! and the remote source registry.

mod remote;

pub use remote::{DEFAULT_REMOTE_NAME, DEFAULT_REMOTE_URL, RemoteSource, RemoteSources};

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::paths;
use crate::error::{GdpmError, Result};
use crate::ui::prelude::*;

fn default_threads() -> usize {
    1
}

fn default_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub path: PathBuf,
    pub token: String,
    pub godot_version: String,
    pub packages_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub remote_sources: RemoteSources,
    /// Worker pool size for package operations
    pub threads: usize,
    /// Per-request timeout in milliseconds
    pub timeout: u64,
    pub enable_sync: bool,
    pub enable_file_logging: bool,
    pub enable_cache: bool,
    pub clean_temporary: bool,
    pub skip_prompt: bool,
    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            username: String::new(),
            password: String::new(),
            path: paths::default_config_path(),
            token: String::new(),
            godot_version: String::new(),
            packages_dir: paths::default_packages_dir(),
            tmp_dir: paths::default_tmp_dir(),
            remote_sources: RemoteSources::with_default(),
            threads: default_threads(),
            timeout: default_timeout(),
            enable_sync: true,
            enable_file_logging: false,
            enable_cache: true,
            clean_temporary: false,
            skip_prompt: false,
            verbose: 0,
        }
    }
}

/// Reject documents that are not objects or lack an object-valued `remote_sources`
pub fn validate(doc: &serde_json::Value, path: &Path) -> Result<()> {
    let invalid = |reason: &str| GdpmError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let Some(object) = doc.as_object() else {
        return Err(invalid("document is not a JSON object"));
    };
    match object.get("remote_sources") {
        None => Err(invalid("could not find `remote_sources`")),
        Some(v) if !v.is_object() => Err(invalid("`remote_sources` is not a JSON object")),
        Some(_) => Ok(()),
    }
}

impl Config {
    /// Load the config from `path`.
    ///
    /// A missing file is the first-run case: defaults are written to `path` and returned.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            let config = Config {
                path: path.to_path_buf(),
                ..Config::default()
            };
            config.save()?;
            emit(
                Level::Info,
                "config.created",
                &format!(
                    "{} No configuration file found. Created {}",
                    char::from(NerdFont::Gear),
                    path.display()
                ),
                None,
            );
            return Ok(config);
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| GdpmError::config_io(path, e))?;
        Self::from_json(&contents, path)
    }

    pub fn from_json(contents: &str, path: &Path) -> Result<Config> {
        let invalid = |reason: String| GdpmError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };
        let doc: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| invalid(format!("invalid JSON: {e}")))?;
        validate(&doc, path)?;

        // Parsed from the text again: `remote_sources` order is priority order
        let mut config: Config =
            serde_json::from_str(contents).map_err(|e| invalid(e.to_string()))?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| GdpmError::ConfigInvalid {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Save the config to `self.path`.
    ///
    /// Written to a sibling temp file and renamed over the target, so an interrupted
    /// save leaves the previous file intact.
    pub fn save(&self) -> Result<()> {
        let path = &self.path;
        let json = self.to_json()?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| GdpmError::config_io(&dir, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| GdpmError::config_io(path, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| GdpmError::config_io(path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| GdpmError::config_io(path, e))?;
        tmp.persist(path)
            .map_err(|e| GdpmError::config_io(path, e.error))?;
        Ok(())
    }

    pub fn packages_path(&self) -> PathBuf {
        paths::expand(&self.packages_dir.to_string_lossy())
    }

    pub fn tmp_path(&self) -> PathBuf {
        paths::expand(&self.tmp_dir.to_string_lossy())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.max(1))
    }

    pub fn jobs(&self) -> usize {
        self.threads.max(1)
    }

    /// Names of every persisted property, in file order
    pub fn property_names(&self) -> Vec<String> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_property(&self, key: &str) -> Result<String> {
        let doc = serde_json::to_value(self).map_err(|e| self.invalid(e.to_string()))?;
        match doc.get(key) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(self.invalid(format!("unknown property `{key}`"))),
        }
    }

    /// Set one property from its string form, keeping the property's type
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        if key == "remote_sources" {
            return Err(self.invalid(
                "`remote_sources` is managed with `gdpm remote add|remove`".to_string(),
            ));
        }
        if key == "path" {
            return Err(self.invalid("`path` is set with --config-path".to_string()));
        }

        let mut doc = serde_json::to_value(&*self).map_err(|e| self.invalid(e.to_string()))?;
        let Some(slot) = doc.get_mut(key) else {
            return Err(self.invalid(format!("unknown property `{key}`")));
        };

        let new_value = match slot {
            serde_json::Value::Bool(_) => serde_json::Value::Bool(parse_bool(value).ok_or_else(
                || self.invalid(format!("`{key}` expects true or false, got `{value}`")),
            )?),
            serde_json::Value::Number(_) => {
                let n: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| self.invalid(format!("`{key}` expects a number, got `{value}`")))?;
                serde_json::Value::from(n)
            }
            _ => serde_json::Value::String(value.to_string()),
        };
        *slot = new_value;

        let mut updated: Config =
            serde_json::from_value(doc).map_err(|e| self.invalid(e.to_string()))?;
        updated.remote_sources = std::mem::take(&mut self.remote_sources);
        *self = updated;
        Ok(())
    }

    pub fn add_remote(&mut self, name: &str, url: &str) -> Result<bool> {
        if name.trim().is_empty() {
            return Err(self.invalid("remote name must not be empty".to_string()));
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| self.invalid(format!("invalid remote URL `{url}`: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(self.invalid(format!("remote URL `{url}` must use http or https")));
        }
        Ok(self
            .remote_sources
            .add(RemoteSource::new(name.trim(), url.trim_end_matches('/'))))
    }

    /// Removing an unknown name is a no-op
    pub fn remove_remote(&mut self, name: &str) -> Option<RemoteSource> {
        self.remote_sources.remove(name)
    }

    fn invalid(&self, reason: String) -> GdpmError {
        GdpmError::ConfigInvalid {
            path: self.path.clone(),
            reason,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
