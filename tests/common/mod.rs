use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated home, config and package directories for one test
pub struct TestEnvironment {
    temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::create_dir_all(temp_dir.path().join("home"))?;
        Ok(Self { temp_dir })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Used as `HOME` for the spawned binary
    pub fn home(&self) -> PathBuf {
        self.path().join("home")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("config").join("config.json")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.path().join("packages")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.path().join("tmp")
    }

    pub fn read_config(&self) -> Result<serde_json::Value> {
        let contents = std::fs::read_to_string(self.config_path())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn write_config(&self, contents: &str) -> Result<()> {
        let path = self.config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}
