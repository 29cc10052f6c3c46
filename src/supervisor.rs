//! Supervisor
//!
//! Orchestrates the service lifecycle: loads persisted state, starts and
//! stops the listener and processor pools, and applies configuration
//! changes by atomically restarting the data plane. Listeners stop before
//! processors so queues drain; processors start before listeners so no
//! record arrives without a queue.

use crate::aggregate::PolicyStore;
use crate::context::AppContext;
use crate::filters::FilterStore;
use crate::health::{self, HealthConfig, HealthReporter};
use crate::listener::ListenerPool;
use crate::processor::{ProcessorPool, SourceStats};
use crate::shutdown::{self, ShutdownHandle};
use crate::sources::{Source, SourcePatch, SourceRegistry};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

struct HealthTask {
    shutdown: ShutdownHandle,
    handle: JoinHandle<()>,
}

/// Service orchestrator. Terminal states: stopped (no listeners, no
/// workers) and running (both active).
pub struct Supervisor {
    ctx: AppContext,
    registry: SourceRegistry,
    filters: Arc<RwLock<FilterStore>>,
    policies: Arc<RwLock<PolicyStore>>,
    listeners: Option<ListenerPool>,
    processors: Option<Arc<ProcessorPool>>,
    health: Option<HealthTask>,
}

impl Supervisor {
    /// Load persisted state and build a stopped supervisor.
    pub fn new(ctx: AppContext) -> Result<Self> {
        let registry = SourceRegistry::load(&ctx)?;
        let filters = Arc::new(RwLock::new(FilterStore::load(&ctx)?));
        let policies = Arc::new(RwLock::new(PolicyStore::load(&ctx)?));
        Ok(Self {
            ctx,
            registry,
            filters,
            policies,
            listeners: None,
            processors: None,
            health: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.processors.is_some()
    }

    /// Start the data plane and, when configured, the health reporter.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            bail!("service is already running");
        }

        let snapshot = self.registry.snapshot();
        let processors =
            ProcessorPool::start(snapshot.clone(), self.filters.clone(), self.policies.clone())?;
        self.listeners = Some(ListenerPool::start(snapshot, processors.clone()));
        self.processors = Some(processors);
        self.start_health().await;

        info!("Service started with {} source(s)", self.registry.sources().len());
        Ok(())
    }

    /// Stop everything: listeners first so no new records arrive, then the
    /// workers (which flush their local batches), then the health loop.
    pub async fn stop(&mut self) {
        if let Some(listeners) = self.listeners.take() {
            listeners.stop().await;
        }
        if let Some(processors) = self.processors.take() {
            processors.stop().await;
        }
        self.stop_health().await;
        info!("Service stopped");
    }

    /// Apply a configuration delta by restarting the data plane against a
    /// fresh source snapshot.
    async fn apply_config_change(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        info!("Applying configuration change");
        self.stop().await;
        self.start().await
    }

    /// Validate and add a source, restarting the data plane on success.
    pub async fn add_source(&mut self, source: Source) -> Result<String> {
        let id = self.registry.add(source).await?;
        self.apply_config_change().await?;
        Ok(id)
    }

    /// Apply a patch to a source, restarting the data plane on success.
    pub async fn update_source(&mut self, id: &str, patch: SourcePatch) -> Result<()> {
        self.registry.update(id, patch).await?;
        self.apply_config_change().await
    }

    /// Delete a source along with its filters, template, and policy, then
    /// restart the data plane.
    pub async fn delete_source(&mut self, id: &str) -> Result<Source> {
        let removed = self.registry.delete(id)?;
        self.filters.write().unwrap().clear_source(id)?;
        self.policies.write().unwrap().delete_template(id)?;
        self.apply_config_change().await?;
        Ok(removed)
    }

    /// Validate and persist the health configuration, then (re)start the
    /// reporter if the service is running.
    pub async fn configure_health(&mut self, config: HealthConfig) -> Result<()> {
        // Probe before persisting so a bad endpoint never sticks
        HealthReporter::configure(config.clone()).await?;
        health::save_config(&self.ctx, &config)?;
        if self.is_running() {
            self.stop_health().await;
            self.start_health().await;
        }
        Ok(())
    }

    /// Per-source pipeline counters, keyed by source ID.
    pub fn stats(&self) -> HashMap<String, SourceStats> {
        self.processors
            .as_ref()
            .map(|p| p.stats())
            .unwrap_or_default()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn filters(&self) -> Arc<RwLock<FilterStore>> {
        self.filters.clone()
    }

    pub fn policies(&self) -> Arc<RwLock<PolicyStore>> {
        self.policies.clone()
    }

    async fn start_health(&mut self) {
        let Some(processors) = self.processors.clone() else {
            return;
        };
        let config = match health::load_config(&self.ctx) {
            Ok(Some(config)) => config,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load health configuration: {e:#}");
                return;
            }
        };

        // A failing endpoint disables reporting for this epoch without
        // touching the data plane
        match HealthReporter::configure(config).await {
            Ok(reporter) => {
                let (shutdown, signal) = shutdown::channel();
                let handle = tokio::spawn(reporter.run(processors, signal));
                self.health = Some(HealthTask { shutdown, handle });
            }
            Err(e) => error!("Health check configuration failed: {e:#}"),
        }
    }

    async fn stop_health(&mut self) {
        if let Some(task) = self.health.take() {
            task.shutdown.shutdown();
            let _ = task.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Protocol, Target};
    use std::net::Ipv4Addr;
    use std::path::Path;
    use tempfile::tempdir;

    fn folder_source(name: &str, ip: u8, port: u16, dir: &Path) -> Source {
        Source {
            id: String::new(),
            name: name.to_string(),
            peer_ip: Ipv4Addr::new(10, 0, 0, ip),
            port,
            protocol: Protocol::Udp,
            target: Target::Folder {
                folder_path: dir.to_path_buf(),
                compression_enabled: false,
                compression_level: 9,
            },
            batch_size: Some(10),
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let tmp = tempdir().unwrap();
        let ctx = AppContext::new(tmp.path().join("data"), tmp.path().join("logs")).unwrap();
        let mut supervisor = Supervisor::new(ctx).unwrap();
        assert!(!supervisor.is_running());

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.start().await.is_err());

        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert!(supervisor.stats().is_empty());
    }

    #[tokio::test]
    async fn test_source_mutation_restarts_data_plane() {
        let tmp = tempdir().unwrap();
        let ctx = AppContext::new(tmp.path().join("data"), tmp.path().join("logs")).unwrap();
        let mut supervisor = Supervisor::new(ctx).unwrap();
        supervisor.start().await.unwrap();

        let id = supervisor
            .add_source(folder_source("app", 1, 19514, &tmp.path().join("out")))
            .await
            .unwrap();
        assert!(supervisor.is_running());
        assert_eq!(supervisor.stats().len(), 1);
        assert_eq!(supervisor.stats()[&id].name, "app");

        supervisor
            .update_source(
                &id,
                SourcePatch {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(supervisor.stats()[&id].name, "renamed");

        supervisor.delete_source(&id).await.unwrap();
        assert!(supervisor.stats().is_empty());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_delete_source_clears_dependent_state() {
        let tmp = tempdir().unwrap();
        let ctx = AppContext::new(tmp.path().join("data"), tmp.path().join("logs")).unwrap();
        let mut supervisor = Supervisor::new(ctx).unwrap();

        let id = supervisor
            .add_source(folder_source("app", 1, 19515, &tmp.path().join("out")))
            .await
            .unwrap();

        supervisor
            .filters()
            .write()
            .unwrap()
            .add_rule(&id, "user", "bob")
            .unwrap();
        supervisor
            .policies()
            .write()
            .unwrap()
            .store_template(&id, "user=a")
            .unwrap();

        supervisor.delete_source(&id).await.unwrap();
        assert!(supervisor.filters().read().unwrap().rules_for(&id).is_empty());
        assert!(!supervisor.policies().read().unwrap().has_template(&id));
    }
}
