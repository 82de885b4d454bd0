//! Path resolution for Ultra's data files.
//!
//! Resolved once at startup from: `--data-dir` / `ULTRA_DATA_DIR` > `~/.ultra`.

use std::io;
use std::path::{Path, PathBuf};

pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let root = match explicit {
            Some(dir) => dir.to_path_buf(),
            None => default_data_dir(),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ultra")
}
