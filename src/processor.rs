//! Processor pool
//!
//! Per-source bounded queues feeding dynamically scaled workers. A worker
//! accumulates a local batch and finalizes it when it reaches the source's
//! batch size or when a non-empty batch has seen no new records for the
//! forced-flush interval. Finalization runs the batch through aggregation,
//! formats events, and delivers to the source's sink.
//!
//! Filters run at enqueue: a dropped record is never queued, never counted
//! as processed, and never resets a worker's activity clock.

use crate::aggregate::PolicyStore;
use crate::filters::FilterStore;
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};
use crate::sink::{self, FolderSink, HecSink, Sink};
use crate::sources::{Source, Target};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Queue depth per worker above which another worker is spawned
pub const QUEUE_SOFT_CAP: usize = 10_000;
/// Inactivity interval after which a non-empty batch is force-flushed
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Longest a worker blocks on an empty queue before re-checking state
const DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Unbounded multi-producer multi-consumer FIFO with a timed pop.
///
/// The soft cap is enforced by worker scaling, not by blocking producers;
/// queues are in-memory and best-effort.
pub struct SourceQueue {
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl SourceQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append a record and return the new depth.
    pub fn push(&self, record: String) -> usize {
        let depth = {
            let mut queue = self.inner.lock().unwrap();
            queue.push_back(record);
            queue.len()
        };
        self.notify.notify_one();
        depth
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<String> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pop one record, waiting up to `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live per-source counters sampled by the health reporter
#[derive(Debug, Clone)]
pub struct SourceStats {
    pub name: String,
    pub queue_size: usize,
    pub active_workers: usize,
    pub processed_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub port: u16,
    pub protocol: String,
    pub target: String,
}

struct SourceState {
    source: Source,
    queue: SourceQueue,
    worker_count: AtomicUsize,
    processed_count: AtomicU64,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
    sink: Arc<dyn Sink>,
}

/// Owns the per-source queues and worker tasks for one configuration epoch.
pub struct ProcessorPool {
    states: HashMap<String, Arc<SourceState>>,
    filters: Arc<RwLock<FilterStore>>,
    policies: Arc<RwLock<PolicyStore>>,
    shutdown: ShutdownHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorPool {
    /// Build queues and sinks for the source snapshot and start one worker
    /// per source.
    pub fn start(
        sources: Arc<HashMap<String, Source>>,
        filters: Arc<RwLock<FilterStore>>,
        policies: Arc<RwLock<PolicyStore>>,
    ) -> Result<Arc<Self>> {
        let (shutdown, _signal) = shutdown::channel();

        let mut states = HashMap::new();
        for (id, source) in sources.iter() {
            let sink: Arc<dyn Sink> = match &source.target {
                Target::Folder {
                    folder_path,
                    compression_enabled,
                    compression_level,
                } => Arc::new(FolderSink::new(
                    &source.name,
                    folder_path,
                    *compression_enabled,
                    *compression_level,
                )),
                Target::Hec { hec_url, hec_token } => {
                    Arc::new(HecSink::new(&source.name, hec_url, hec_token)?)
                }
            };

            states.insert(
                id.clone(),
                Arc::new(SourceState {
                    source: source.clone(),
                    queue: SourceQueue::new(),
                    worker_count: AtomicUsize::new(0),
                    processed_count: AtomicU64::new(0),
                    last_processed_at: Mutex::new(None),
                    sink,
                }),
            );
        }

        let pool = Arc::new(Self {
            states,
            filters,
            policies,
            shutdown,
            workers: Mutex::new(Vec::new()),
        });

        for state in pool.states.values() {
            pool.spawn_worker(state.clone());
        }
        info!("Started workers for {} source(s)", pool.states.len());
        Ok(pool)
    }

    /// Queue a record for a source.
    ///
    /// Captures the source's template on the first record seen while none
    /// exists, then applies the source's filters; records that fail a
    /// filter are dropped here and leave no trace in the pipeline.
    pub fn enqueue(&self, source_id: &str, record: String) {
        let Some(state) = self.states.get(source_id) else {
            warn!("Dropping record for unknown source {source_id}");
            return;
        };

        if !self.policies.read().unwrap().has_template(source_id) {
            // Tolerant of extraction problems: a failed capture is logged
            // and the record still flows
            if let Err(e) = self
                .policies
                .write()
                .unwrap()
                .store_template(source_id, &record)
            {
                error!("Failed to capture template for source {source_id}: {e:#}");
            }
        }

        if !self.filters.read().unwrap().passes(&record, source_id) {
            return;
        }

        let depth = state.queue.push(record);
        let workers = state.worker_count.load(Ordering::Relaxed).max(1);
        if depth > QUEUE_SOFT_CAP * workers {
            info!(
                "Spawning additional worker for source {} (queue depth {depth})",
                state.source.name
            );
            self.spawn_worker(state.clone());
        }
    }

    /// Signal every worker to stop and wait for their final flushes.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!("All workers stopped");
    }

    /// Current per-source counters, keyed by source ID.
    pub fn stats(&self) -> HashMap<String, SourceStats> {
        self.states
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    SourceStats {
                        name: state.source.name.clone(),
                        queue_size: state.queue.len(),
                        active_workers: state.worker_count.load(Ordering::Relaxed),
                        processed_count: state.processed_count.load(Ordering::Relaxed),
                        last_processed_at: *state.last_processed_at.lock().unwrap(),
                        port: state.source.port,
                        protocol: state.source.protocol.to_string(),
                        target: state.source.target.kind().to_string(),
                    },
                )
            })
            .collect()
    }

    fn spawn_worker(&self, state: Arc<SourceState>) {
        state.worker_count.fetch_add(1, Ordering::Relaxed);
        let policies = self.policies.clone();
        let signal = self.shutdown.subscribe();
        let handle = tokio::spawn(run_worker(state, policies, signal));
        self.workers.lock().unwrap().push(handle);
    }
}

/// Worker loop: dequeue with a short wait, drain opportunistically, and
/// finalize on batch size or forced flush. The local batch is flushed a
/// final time when the pool stops.
async fn run_worker(
    state: Arc<SourceState>,
    policies: Arc<RwLock<PolicyStore>>,
    signal: ShutdownSignal,
) {
    let batch_size = state.source.batch_size();
    let mut batch: Vec<String> = Vec::new();
    let mut last_activity = Instant::now();

    while !signal.is_shutdown() {
        if let Some(record) = state.queue.pop_timeout(DEQUEUE_WAIT).await {
            batch.push(record);
            last_activity = Instant::now();
            while batch.len() < batch_size {
                match state.queue.try_pop() {
                    Some(record) => batch.push(record),
                    None => break,
                }
            }
        }

        let forced = !batch.is_empty() && last_activity.elapsed() >= FLUSH_INTERVAL;
        if batch.len() >= batch_size || forced {
            if forced {
                info!(
                    "Forced flush after {}s of inactivity for source {} ({} records)",
                    last_activity.elapsed().as_secs(),
                    state.source.name,
                    batch.len()
                );
            }
            finalize(&state, &policies, std::mem::take(&mut batch)).await;
            last_activity = Instant::now();
        }
    }

    if !batch.is_empty() {
        finalize(&state, &policies, std::mem::take(&mut batch)).await;
    }
}

/// Aggregate, format, and deliver one batch. Metrics count the
/// pre-aggregation record count and only move on successful delivery.
async fn finalize(
    state: &SourceState,
    policies: &Arc<RwLock<PolicyStore>>,
    batch: Vec<String>,
) {
    let record_count = batch.len();
    let collapsed = {
        let store = policies.read().unwrap();
        store.aggregate_batch(batch, &state.source.id)
    };
    let events = sink::build_events(&collapsed, &state.source.name);

    match state.sink.deliver(&events).await {
        Ok(()) => {
            state
                .processed_count
                .fetch_add(record_count as u64, Ordering::Relaxed);
            *state.last_processed_at.lock().unwrap() = Some(Utc::now());
        }
        Err(e) => {
            error!(
                "Error delivering batch for source {}: {e:#}",
                state.source.name
            );
        }
    }
}
