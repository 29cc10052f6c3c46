//! Health reporter
//!
//! Samples host and pipeline telemetry on a fixed interval and POSTs it to
//! a configured HEC endpoint as a single JSON event. Configuration is
//! validated with a test POST before the reporter ever starts, and a
//! failed periodic POST is logged without stopping the loop.

use crate::context::{load_json_or_default, save_json_atomic, AppContext};
use crate::processor::ProcessorPool;
use crate::shutdown::ShutdownSignal;
use crate::sink::hec;
use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};
use tracing::{error, info};

/// Health reporter configuration singleton
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub hec_url: String,
    pub hec_token: String,
    pub interval_seconds: u64,
}

/// Load the persisted health configuration, if any.
pub fn load_config(ctx: &AppContext) -> Result<Option<HealthConfig>> {
    load_json_or_default(&ctx.health_file())
}

/// Persist the health configuration.
pub fn save_config(ctx: &AppContext, config: &HealthConfig) -> Result<()> {
    save_json_atomic(&ctx.health_file(), &Some(config.clone()))
}

/// Periodic system and pipeline telemetry reporter
pub struct HealthReporter {
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthReporter {
    /// Validate the endpoint with a test POST and build the reporter.
    /// A non-200 response rejects the configuration.
    pub async fn configure(config: HealthConfig) -> Result<Self> {
        if config.interval_seconds == 0 {
            bail!("health check interval must be greater than zero");
        }
        hec::probe_health(&config.hec_url, &config.hec_token).await?;
        info!("Health check configured successfully");

        Ok(Self {
            client: hec::client(Duration::from_secs(30))?,
            config,
        })
    }

    /// Sampling loop; runs until the stop signal fires.
    pub async fn run(self, pool: Arc<ProcessorPool>, mut signal: ShutdownSignal) {
        info!(
            "Health reporting started (every {}s)",
            self.config.interval_seconds
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = signal.recv() => break,
                _ = ticker.tick() => {
                    let payload = build_health_event(&pool);
                    if let Err(e) = hec::post(
                        &self.client,
                        &self.config.hec_url,
                        &self.config.hec_token,
                        payload.to_string(),
                    )
                    .await
                    {
                        error!("Error sending health data: {e:#}");
                    }
                }
            }
        }
        info!("Health reporting stopped");
    }
}

/// Sample host metrics and per-source pipeline counters into the health
/// event body.
pub fn build_health_event(pool: &ProcessorPool) -> Value {
    let mut system = System::new_all();
    system.refresh_all();

    let cpu_count = system.cpus().len();
    let load = System::load_average();
    let cpu = json!({
        "percent": system.global_cpu_info().cpu_usage(),
        "count": cpu_count,
        "load": [load.one, load.five, load.fifteen],
    });

    let total_memory = system.total_memory();
    let used_memory = system.used_memory();
    let memory_percent = if total_memory > 0 {
        used_memory as f64 / total_memory as f64 * 100.0
    } else {
        0.0
    };
    let memory = json!({
        "total": total_memory,
        "available": system.available_memory(),
        "percent": memory_percent,
        "used": used_memory,
    });

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().next());
    let disk = match root {
        Some(disk) => {
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            let percent = if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            json!({ "total": total, "used": used, "free": free, "percent": percent })
        }
        None => json!({ "total": 0, "used": 0, "free": 0, "percent": 0.0 }),
    };

    let networks = Networks::new_with_refreshed_list();
    let mut bytes_sent = 0u64;
    let mut bytes_recv = 0u64;
    let mut packets_sent = 0u64;
    let mut packets_recv = 0u64;
    for (_name, data) in &networks {
        bytes_sent += data.total_transmitted();
        bytes_recv += data.total_received();
        packets_sent += data.total_packets_transmitted();
        packets_recv += data.total_packets_received();
    }
    let network = json!({
        "bytes_sent": bytes_sent,
        "bytes_recv": bytes_recv,
        "packets_sent": packets_sent,
        "packets_recv": packets_recv,
    });

    let mut sources = Map::new();
    for stats in pool.stats().into_values() {
        sources.insert(
            stats.name.clone(),
            json!({
                "queue_size": stats.queue_size,
                "active_workers": stats.active_workers,
                "port": stats.port,
                "protocol": stats.protocol,
                "target": stats.target,
            }),
        );
    }

    let pid = sysinfo::get_current_pid().ok();
    let process_memory = pid
        .and_then(|pid| system.process(pid))
        .map(|process| process.memory())
        .unwrap_or(0);

    json!({
        "time": Utc::now().timestamp(),
        "event": {
            "cpu": cpu,
            "memory": memory,
            "disk": disk,
            "network": network,
            "sources": Value::Object(sources),
            "pid": pid.map(|p| p.as_u32()),
            "process_memory": process_memory,
        },
        "source": "Heartbeat",
    })
}
