//! Run Directory
//!
//! Files the engine writes for a run, under `.opexec/` in the run directory.
//!
//! File structure:
//! ```text
//! <run>/
//! └── .opexec/
//!     ├── output          # Raw captured bytes, both streams interleaved
//!     ├── output.index    # 9-byte line records (timestamp + stream tag)
//!     ├── LOCK            # Child pid while the process runs
//!     └── attrs/
//!         └── <name>      # One JSON document per attribute
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, RunnerError};

const META_DIR: &str = ".opexec";
const ATTRS_DIR: &str = "attrs";
const OUTPUT_FILE: &str = "output";
const INDEX_FILE: &str = "output.index";
const LOCK_FILE: &str = "LOCK";

/// Handle on one run's directory; nothing is touched until [`init`](Self::init).
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The directory the process runs in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn meta_dir(&self) -> PathBuf {
        self.path.join(META_DIR)
    }

    /// Raw output log.
    pub fn output_path(&self) -> PathBuf {
        self.meta_dir().join(OUTPUT_FILE)
    }

    /// Line index alongside the output log.
    pub fn index_path(&self) -> PathBuf {
        self.meta_dir().join(INDEX_FILE)
    }

    /// Present only while the process runs.
    pub fn lock_path(&self) -> PathBuf {
        self.meta_dir().join(LOCK_FILE)
    }

    fn attr_path(&self, name: &str) -> PathBuf {
        self.meta_dir().join(ATTRS_DIR).join(name)
    }

    /// Create the run and metadata directories
    pub async fn init(&self) -> Result<()> {
        let attrs = self.meta_dir().join(ATTRS_DIR);
        fs::create_dir_all(&attrs).await?;
        debug!("Initialized run directory {}", self.path.display());
        Ok(())
    }

    /// Write `value` as JSON under `attrs/<name>`, replacing any previous value.
    pub async fn write_attr<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value).map_err(|e| {
            RunnerError::Serialization(format!("Failed to serialize attribute {}: {}", name, e))
        })?;
        fs::write(self.attr_path(name), content).await?;
        Ok(())
    }

    /// Read an attribute; `None` when it was never written.
    pub async fn read_attr<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.attr_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&content).map_err(|e| {
            RunnerError::Serialization(format!("Failed to parse attribute {}: {}", name, e))
        })?;
        Ok(Some(value))
    }

    /// Mark the run as running under `pid`.
    pub async fn write_lock(&self, pid: u32) -> Result<()> {
        fs::write(self.lock_path(), pid.to_string()).await?;
        Ok(())
    }

    /// Pid recorded in the lock file, if the run is marked as running.
    pub async fn read_lock(&self) -> Result<Option<u32>> {
        let path = self.lock_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(content.trim().parse().ok())
    }

    /// Mark the run as stopped; a missing LOCK is not an error.
    pub async fn delete_lock(&self) -> Result<()> {
        let path = self.lock_path();
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
