//! Logrelay - multi-source log ingestion and forwarding service
//!
//! Terminates syslog-style UDP and TCP streams from authorized senders,
//! normalizes each record into a structured event, optionally filters and
//! aggregates it, and delivers batches to a local folder or an HTTP Event
//! Collector. A periodic health reporter ships host and pipeline telemetry.

pub mod aggregate;
pub mod context;
pub mod filters;
pub mod health;
pub mod listener;
pub mod processor;
pub mod shutdown;
pub mod sink;
pub mod sources;
pub mod supervisor;
pub mod template;
