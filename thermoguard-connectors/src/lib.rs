//! Async Runtime and Subscriber Connectors for ThermoGuard
//!
//! ## Overview
//!
//! The core and ml crates are synchronous building blocks. This crate wires
//! them into a running system on tokio:
//!
//! - [`PipelineHandle`]: the staged pipeline (validator, interpolation
//!   updater, window aggregator, anomaly detector, sharded alert workers)
//!   behind one handle for ingestion, queries, metrics and shutdown.
//! - [`FanoutHub`]: per-client filtered delivery with bounded drop-oldest
//!   queues and one delivery task per client.
//! - [`ClientSink`]: the transport seam; [`ChannelSink`] is the in-process
//!   implementation.
//! - [`apply_control`]: subscribe and unsubscribe control messages.
//!
//! ## Isolation
//!
//! Failures stay where they happen:
//!
//! | Failure | Blast radius |
//! |---------|--------------|
//! | malformed or out-of-range reading | that reading (rejected, counted) |
//! | full ingestion queue | that call (`QueueFull` to the producer) |
//! | stage queue full past its bounded wait | that message (dropped, counted) |
//! | slow client | that client's oldest messages |
//! | failing sink | that client (disconnected) |
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use thermoguard_connectors::{ChannelSink, PipelineHandle};
//! use thermoguard_core::{PipelineConfig, Position, SystemTime, Severity, Topic};
//! use thermoguard_schemas::SubscriptionFilter;
//!
//! # async fn run() -> Result<(), thermoguard_connectors::ConnectorError> {
//! let pipeline = PipelineHandle::start(PipelineConfig::data_center(), Arc::new(SystemTime))?;
//! pipeline.registry().register("rack-07", "cold-aisle-2", Position::planar(12.5, 3.0));
//!
//! let (sink, mut events) = ChannelSink::pair(64);
//! pipeline.subscribe(
//!     "dashboard",
//!     SubscriptionFilter::topics(&[Topic::Alerts]).with_min_severity(Severity::Warning),
//!     Box::new(sink),
//! )?;
//!
//! pipeline.ingest_json(
//!     r#"{"sensorId":"rack-07","timestamp":1718000000000,"value":24.6,
//!         "unit":"celsius","zoneId":"cold-aisle-2"}"#,
//! )?;
//!
//! let estimate = pipeline.interpolate(12.0, 3.0);
//! if let Some(value) = estimate.value {
//!     println!("{:.1} °C ({:.0}% confidence)", value, estimate.confidence * 100.0);
//! }
//!
//! if let Some(alert) = events.recv().await {
//!     println!("{}", alert.payload);
//! }
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

use thiserror::Error;

use thermoguard_core::TelemetryError;
use thermoguard_schemas::SchemaError;

pub mod control;
pub mod fanout;
pub mod pipeline;
pub mod sink;

pub use control::{apply_control, apply_control_json};
pub use fanout::{ClientStats, FanoutHub};
pub use pipeline::PipelineHandle;
pub use sink::{ChannelSink, ClientSink, SinkError};

/// Runtime errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Rejected by the pipeline (`QueueFull`, `InvalidConfig`, ...)
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// Malformed wire message
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Pipeline is shut down")]
    ShutDown,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ConnectorError {
    /// The pipeline rejection behind this error, if any
    pub fn telemetry(&self) -> Option<&TelemetryError> {
        match self {
            ConnectorError::Telemetry(err) => Some(err),
            _ => None,
        }
    }
}
