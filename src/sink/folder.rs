//! Filesystem sink
//!
//! Writes each batch as a timestamped newline-delimited JSON file under the
//! source's folder, optionally gzip-compressed, and appends an entry to the
//! folder's `index.json` manifest. The manifest has a single writer per
//! folder: deliveries for a source serialize behind the sink's lock.

use crate::context::save_json_atomic;
use crate::sink::{Event, Sink};
use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Folder manifest: one entry per delivered batch file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexFile {
    pub files: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub filename: String,
    pub timestamp: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
}

/// Folder-based delivery target with optional gzip compression
pub struct FolderSink {
    source_name: String,
    folder_path: PathBuf,
    compression_enabled: bool,
    compression_level: u32,
    // Serializes file and manifest writes for this folder
    write_lock: Mutex<()>,
}

impl FolderSink {
    pub fn new(
        source_name: &str,
        folder_path: &Path,
        compression_enabled: bool,
        compression_level: u32,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            folder_path: folder_path.to_path_buf(),
            compression_enabled,
            compression_level,
            write_lock: Mutex::new(()),
        }
    }

    fn write_batch(&self, events: &[Event]) -> Result<String> {
        fs::create_dir_all(&self.folder_path).with_context(|| {
            format!("Failed to create folder {}", self.folder_path.display())
        })?;

        let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        let filename = if self.compression_enabled {
            format!("{stamp}.json.gz")
        } else {
            format!("{stamp}.json")
        };
        let path = self.folder_path.join(&filename);

        let mut ndjson = String::new();
        for event in events {
            ndjson.push_str(&serde_json::to_string(event)?);
            ndjson.push('\n');
        }

        if self.compression_enabled {
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut encoder = GzEncoder::new(file, Compression::new(self.compression_level));
            encoder.write_all(ndjson.as_bytes())?;
            encoder.finish().context("Failed to finish gzip stream")?;
        } else {
            fs::write(&path, ndjson)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        self.append_index_entry(IndexEntry {
            filename: filename.clone(),
            timestamp: stamp,
            count: events.len(),
            compressed: self.compression_enabled.then_some(true),
            compression_level: self
                .compression_enabled
                .then_some(self.compression_level),
        })?;

        Ok(filename)
    }

    fn append_index_entry(&self, entry: IndexEntry) -> Result<()> {
        let index_path = self.folder_path.join("index.json");
        let mut index = match crate::context::load_json_or_default::<IndexFile>(&index_path) {
            Ok(index) => index,
            Err(e) => {
                // A corrupt manifest starts over rather than blocking delivery
                warn!(
                    "Manifest {} is unreadable, starting fresh: {e:#}",
                    index_path.display()
                );
                IndexFile::default()
            }
        };
        index.files.push(entry);
        save_json_atomic(&index_path, &index)
    }
}

#[async_trait::async_trait]
impl Sink for FolderSink {
    async fn deliver(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let filename = self.write_batch(events)?;
        info!(
            "Delivered {} events to {} for source {}",
            events.len(),
            filename,
            self.source_name
        );
        Ok(())
    }
}
