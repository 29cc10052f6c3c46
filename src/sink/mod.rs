//! Delivery sinks
//!
//! A finalized batch is formatted into events and handed to the source's
//! sink. Sinks are stateless apart from the folder sink's index manifest.

pub mod folder;
pub mod hec;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use folder::FolderSink;
pub use hec::HecSink;

/// A single delivery-ready event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unix timestamp stamped at batch finalization
    pub time: i64,
    /// Parsed JSON body when the record parses, the raw string otherwise
    pub event: Value,
    /// Name of the source the record arrived on
    pub source: String,
}

/// Trait for batch delivery targets
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Deliver a finalized event batch. An error means the batch is lost;
    /// the pipeline continues.
    async fn deliver(&self, events: &[Event]) -> Result<()>;
}

/// Build events for a batch. Records that parse as JSON are embedded
/// parsed; everything else is carried as the raw string.
pub fn build_events(batch: &[String], source_name: &str) -> Vec<Event> {
    let now = Utc::now().timestamp();
    batch
        .iter()
        .map(|record| {
            let body = serde_json::from_str::<Value>(record)
                .unwrap_or_else(|_| Value::String(record.clone()));
            Event {
                time: now,
                event: body,
                source: source_name.to_string(),
            }
        })
        .collect()
}
