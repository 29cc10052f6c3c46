//! Source registry
//!
//! A source is a configured (peer IP, port, protocol) ingestion endpoint
//! bound to one delivery target. This module owns the source records,
//! validates mutations, and persists the full set atomically on every
//! successful change.

use crate::context::{load_json_or_default, save_json_atomic, AppContext};
use crate::sink::hec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Default batch size for HEC targets
pub const DEFAULT_HEC_BATCH_SIZE: usize = 500;
/// Default batch size for folder targets
pub const DEFAULT_FOLDER_BATCH_SIZE: usize = 5000;
/// Default gzip level for folder targets
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Transport protocol a source sends over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Protocol::Udp),
            "TCP" => Ok(Protocol::Tcp),
            _ => Err(SourceError::InvalidProtocol),
        }
    }
}

/// Delivery target for a source's batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "UPPERCASE")]
pub enum Target {
    /// Write batches as NDJSON files under a local directory
    Folder {
        folder_path: PathBuf,
        #[serde(default = "default_true")]
        compression_enabled: bool,
        #[serde(default = "default_compression_level")]
        compression_level: u32,
    },
    /// POST batches to an HTTP Event Collector endpoint
    Hec { hec_url: String, hec_token: String },
}

impl Target {
    /// Short label used in logs and health telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Folder { .. } => "FOLDER",
            Target::Hec { .. } => "HEC",
        }
    }
}

/// A configured log source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Opaque unique identifier, assigned at creation
    #[serde(default)]
    pub id: String,
    /// Display name, also stamped on every delivered event
    pub name: String,
    /// Sender address admitted on this source's port; globally unique
    pub peer_ip: Ipv4Addr,
    /// Listener port (1-65535)
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(flatten)]
    pub target: Target,
    /// Records per delivered batch; defaulted per target when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl Source {
    /// Effective batch size, falling back to the per-target default.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(match self.target {
            Target::Hec { .. } => DEFAULT_HEC_BATCH_SIZE,
            Target::Folder { .. } => DEFAULT_FOLDER_BATCH_SIZE,
        })
    }
}

/// Partial update applied over an existing source
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcePatch {
    pub name: Option<String>,
    pub peer_ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub target: Option<Target>,
    pub batch_size: Option<usize>,
}

/// Validation and persistence errors surfaced to the operator path
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("peer IP {0} is already used by source '{1}'")]
    DuplicateIp(Ipv4Addr, String),
    #[error("listener port must be between 1 and 65535")]
    InvalidPort,
    #[error("protocol must be either UDP or TCP")]
    InvalidProtocol,
    #[error("batch size must be a positive integer")]
    InvalidBatchSize,
    #[error("compression level must be between 1 and 9")]
    InvalidCompressionLevel,
    #[error("target check failed: {0}")]
    TargetUnreachable(String),
    #[error("folder {0} is not writable: {1}")]
    PathUnwritable(PathBuf, String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("no source with ID {0}")]
    UnknownSource(String),
    #[error("failed to persist source configuration: {0}")]
    Persist(String),
}

/// Owns the configured sources and their on-disk representation.
pub struct SourceRegistry {
    sources: HashMap<String, Source>,
    path: PathBuf,
}

impl SourceRegistry {
    /// Load the registry from the context's sources file.
    pub fn load(ctx: &AppContext) -> anyhow::Result<Self> {
        let path = ctx.sources_file();
        let sources: HashMap<String, Source> = load_json_or_default(&path)?;
        if !sources.is_empty() {
            info!("Loaded {} source(s)", sources.len());
        }
        Ok(Self { sources, path })
    }

    /// All configured sources, keyed by ID.
    pub fn sources(&self) -> &HashMap<String, Source> {
        &self.sources
    }

    /// Immutable snapshot for the data plane; taken once per configuration
    /// epoch.
    pub fn snapshot(&self) -> Arc<HashMap<String, Source>> {
        Arc::new(self.sources.clone())
    }

    /// Look up a source by ID.
    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    /// Validate and add a new source, returning its assigned ID.
    pub async fn add(&mut self, mut source: Source) -> Result<String, SourceError> {
        source.id = Uuid::new_v4().to_string();
        if source.batch_size.is_none() {
            source.batch_size = Some(source.batch_size());
        }

        self.validate(&source, None).await?;

        let id = source.id.clone();
        let name = source.name.clone();
        self.sources.insert(id.clone(), source);
        self.persist()?;
        info!("Added source '{}' (ID: {})", name, id);
        Ok(id)
    }

    /// Merge a patch over an existing source and re-validate the result.
    pub async fn update(&mut self, id: &str, patch: SourcePatch) -> Result<(), SourceError> {
        let mut updated = self
            .sources
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::UnknownSource(id.to_string()))?;

        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(peer_ip) = patch.peer_ip {
            updated.peer_ip = peer_ip;
        }
        if let Some(port) = patch.port {
            updated.port = port;
        }
        if let Some(protocol) = patch.protocol {
            updated.protocol = protocol;
        }
        if let Some(target) = patch.target {
            updated.target = target;
        }
        if let Some(batch_size) = patch.batch_size {
            updated.batch_size = Some(batch_size);
        }

        self.validate(&updated, Some(id)).await?;

        let name = updated.name.clone();
        self.sources.insert(id.to_string(), updated);
        self.persist()?;
        info!("Updated source '{}' (ID: {})", name, id);
        Ok(())
    }

    /// Remove a source, returning the removed record.
    pub fn delete(&mut self, id: &str) -> Result<Source, SourceError> {
        let removed = self
            .sources
            .remove(id)
            .ok_or_else(|| SourceError::UnknownSource(id.to_string()))?;
        self.persist()?;
        info!("Deleted source '{}' (ID: {})", removed.name, id);
        Ok(removed)
    }

    /// Validate a source record. `skip_id` excludes the record itself from
    /// the uniqueness check on update.
    async fn validate(&self, source: &Source, skip_id: Option<&str>) -> Result<(), SourceError> {
        if source.name.trim().is_empty() {
            return Err(SourceError::MissingField("name"));
        }
        if source.port == 0 {
            return Err(SourceError::InvalidPort);
        }
        if source.batch_size == Some(0) {
            return Err(SourceError::InvalidBatchSize);
        }

        // Uniqueness before target probes: cheap checks first
        for (id, existing) in &self.sources {
            if Some(id.as_str()) == skip_id {
                continue;
            }
            if existing.peer_ip == source.peer_ip {
                return Err(SourceError::DuplicateIp(
                    source.peer_ip,
                    existing.name.clone(),
                ));
            }
        }

        match &source.target {
            Target::Folder {
                folder_path,
                compression_level,
                ..
            } => {
                if !(1..=9).contains(compression_level) {
                    return Err(SourceError::InvalidCompressionLevel);
                }
                probe_folder(folder_path)?;
            }
            Target::Hec { hec_url, hec_token } => {
                if hec_url.trim().is_empty() {
                    return Err(SourceError::MissingField("hec_url"));
                }
                if hec_token.trim().is_empty() {
                    return Err(SourceError::MissingField("hec_token"));
                }
                hec::probe_source(hec_url, hec_token, &source.name)
                    .await
                    .map_err(|e| SourceError::TargetUnreachable(e.to_string()))?;
            }
        }

        Ok(())
    }

    fn persist(&self) -> Result<(), SourceError> {
        save_json_atomic(&self.path, &self.sources).map_err(|e| {
            error!("Failed to save source configuration: {e:#}");
            SourceError::Persist(e.to_string())
        })
    }
}

/// Check that the folder exists (creating it if needed) and survives a
/// write-and-delete probe.
fn probe_folder(path: &Path) -> Result<(), SourceError> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| SourceError::PathUnwritable(path.to_path_buf(), e.to_string()))?;
    }
    let probe = path.join(".probe_write");
    fs::write(&probe, b"probe")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| SourceError::PathUnwritable(path.to_path_buf(), e.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_protocol() -> Protocol {
    Protocol::Udp
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn folder_source(name: &str, ip: [u8; 4], port: u16, dir: &Path) -> Source {
        Source {
            id: String::new(),
            name: name.to_string(),
            peer_ip: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
            port,
            protocol: Protocol::Udp,
            target: Target::Folder {
                folder_path: dir.to_path_buf(),
                compression_enabled: false,
                compression_level: DEFAULT_COMPRESSION_LEVEL,
            },
            batch_size: None,
        }
    }

    fn registry(dir: &Path) -> SourceRegistry {
        let ctx = AppContext::new(dir.join("data"), dir.join("logs")).unwrap();
        SourceRegistry::load(&ctx).unwrap()
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_batch_default() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());

        let id = reg
            .add(folder_source("web", [10, 0, 0, 1], 514, &tmp.path().join("out")))
            .await
            .unwrap();

        let source = reg.get(&id).unwrap();
        assert_eq!(source.id, id);
        assert_eq!(source.batch_size(), DEFAULT_FOLDER_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_duplicate_peer_ip_rejected() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());
        let out = tmp.path().join("out");

        reg.add(folder_source("first", [10, 0, 0, 1], 514, &out))
            .await
            .unwrap();
        let err = reg
            .add(folder_source("second", [10, 0, 0, 1], 515, &out))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::DuplicateIp(_, _)));

        // Every remaining source keeps a distinct peer IP
        let ips: std::collections::HashSet<_> =
            reg.sources().values().map(|s| s.peer_ip).collect();
        assert_eq!(ips.len(), reg.sources().len());
    }

    #[tokio::test]
    async fn test_port_sharing_allowed_with_distinct_ips() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());
        let out = tmp.path().join("out");

        reg.add(folder_source("a", [10, 0, 0, 1], 514, &out))
            .await
            .unwrap();
        reg.add(folder_source("b", [10, 0, 0, 2], 514, &out))
            .await
            .unwrap();
        assert_eq!(reg.sources().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_port_and_batch_size() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());
        let out = tmp.path().join("out");

        let mut source = folder_source("bad", [10, 0, 0, 1], 0, &out);
        assert!(matches!(
            reg.add(source.clone()).await.unwrap_err(),
            SourceError::InvalidPort
        ));

        source.port = 514;
        source.batch_size = Some(0);
        assert!(matches!(
            reg.add(source).await.unwrap_err(),
            SourceError::InvalidBatchSize
        ));
    }

    #[tokio::test]
    async fn test_compression_level_bounds() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());

        let mut source = folder_source("c", [10, 0, 0, 3], 514, &tmp.path().join("out"));
        if let Target::Folder {
            ref mut compression_level,
            ..
        } = source.target
        {
            *compression_level = 12;
        }
        assert!(matches!(
            reg.add(source).await.unwrap_err(),
            SourceError::InvalidCompressionLevel
        ));
    }

    #[tokio::test]
    async fn test_update_patch_and_revalidation() {
        let tmp = tempdir().unwrap();
        let mut reg = registry(tmp.path());
        let out = tmp.path().join("out");

        let a = reg
            .add(folder_source("a", [10, 0, 0, 1], 514, &out))
            .await
            .unwrap();
        reg.add(folder_source("b", [10, 0, 0, 2], 515, &out))
            .await
            .unwrap();

        // Moving a onto b's IP violates uniqueness
        let err = reg
            .update(
                &a,
                SourcePatch {
                    peer_ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::DuplicateIp(_, _)));

        reg.update(
            &a,
            SourcePatch {
                port: Some(1514),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(reg.get(&a).unwrap().port, 1514);
    }

    #[tokio::test]
    async fn test_delete_and_persistence_round_trip() {
        let tmp = tempdir().unwrap();
        let ctx = AppContext::new(tmp.path().join("data"), tmp.path().join("logs")).unwrap();
        let out = tmp.path().join("out");

        let id = {
            let mut reg = SourceRegistry::load(&ctx).unwrap();
            reg.add(folder_source("keep", [10, 0, 0, 1], 514, &out))
                .await
                .unwrap();
            reg.add(folder_source("drop", [10, 0, 0, 2], 515, &out))
                .await
                .unwrap()
        };

        let mut reloaded = SourceRegistry::load(&ctx).unwrap();
        assert_eq!(reloaded.sources().len(), 2);

        let removed = reloaded.delete(&id).unwrap();
        assert_eq!(removed.name, "drop");

        let reloaded = SourceRegistry::load(&ctx).unwrap();
        assert_eq!(reloaded.sources().len(), 1);
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!(matches!(
            "ICMP".parse::<Protocol>().unwrap_err(),
            SourceError::InvalidProtocol
        ));
    }

    #[test]
    fn test_source_serialization_is_flat() {
        let source = Source {
            id: "abc".to_string(),
            name: "hec".to_string(),
            peer_ip: Ipv4Addr::new(10, 0, 0, 9),
            port: 601,
            protocol: Protocol::Tcp,
            target: Target::Hec {
                hec_url: "https://hec.example:8088".to_string(),
                hec_token: "tok".to_string(),
            },
            batch_size: Some(500),
        };

        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["target"], "HEC");
        assert_eq!(json["hec_url"], "https://hec.example:8088");
        assert_eq!(json["protocol"], "TCP");
    }
}
