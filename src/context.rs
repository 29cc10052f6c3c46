//! Application context
//!
//! Threads the process-wide directories and state-file locations through the
//! service as one explicit object instead of ambient globals, and provides
//! the atomic JSON persistence helpers shared by every store.

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide paths for persisted state and diagnostic logs.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Base directory for persisted state files
    pub data_dir: PathBuf,
    /// Directory for the service's own diagnostic logs
    pub log_dir: PathBuf,
}

impl AppContext {
    /// Create a context rooted at the given directories, creating them if needed.
    pub fn new(data_dir: PathBuf, log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        Ok(Self { data_dir, log_dir })
    }

    /// Default base directory when none is given on the command line.
    pub fn default_base_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("logrelay")
    }

    /// Path of the source configuration file.
    pub fn sources_file(&self) -> PathBuf {
        self.data_dir.join("sources.json")
    }

    /// Path of the aggregation policy and template file.
    pub fn policy_file(&self) -> PathBuf {
        self.data_dir.join("policy.json")
    }

    /// Path of the filter rule file.
    pub fn filter_file(&self) -> PathBuf {
        self.data_dir.join("filters.json")
    }

    /// Path of the health reporter configuration file.
    pub fn health_file(&self) -> PathBuf {
        self.data_dir.join("health.json")
    }
}

/// Write a value as pretty JSON via a temp file and rename.
///
/// Readers never observe a partially written file; the rename is the commit
/// point.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    fs::write(&tmp, data).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Load a JSON state file, returning the default when the file is absent.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_context_creates_directories() {
        let tmp = tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let log_dir = tmp.path().join("logs");

        let ctx = AppContext::new(data_dir.clone(), log_dir.clone()).unwrap();
        assert!(data_dir.is_dir());
        assert!(log_dir.is_dir());
        assert_eq!(ctx.sources_file(), data_dir.join("sources.json"));
        assert_eq!(ctx.policy_file(), data_dir.join("policy.json"));
        assert_eq!(ctx.filter_file(), data_dir.join("filters.json"));
    }

    #[test]
    fn test_atomic_save_and_load_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");

        let mut value = HashMap::new();
        value.insert("key".to_string(), 42u64);
        save_json_atomic(&path, &value).unwrap();

        let loaded: HashMap<String, u64> = load_json_or_default(&path).unwrap();
        assert_eq!(loaded.get("key"), Some(&42));

        // No temp file left behind after the rename
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let tmp = tempdir().unwrap();
        let loaded: HashMap<String, u64> =
            load_json_or_default(&tmp.path().join("absent.json")).unwrap();
        assert!(loaded.is_empty());
    }
}
