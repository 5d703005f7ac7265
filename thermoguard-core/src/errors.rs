//! Error Types for the Telemetry Pipeline
//!
//! ## Design Philosophy
//!
//! Errors in ThermoGuard are *local*: a bad reading, a degenerate sensor
//! layout or a slow client is handled where it happens (rejected, counted,
//! logged) and never crashes the pipeline. The error type therefore has to do
//! two jobs:
//!
//! 1. **Carry context** for logs and for the upstream collaborator that fed a
//!    reading (which field was malformed, what the bounds were).
//! 2. **Collapse to a counter key**: every variant maps to a [`RejectReason`],
//!    a `Copy` discriminant used to index the rejection counters exposed as
//!    metrics.
//!
//! ## Error Categories
//!
//! ### Ingestion
//! - `InvalidSchema`: required field missing or malformed, unknown unit, NaN
//! - `OutOfRange`: value outside the configured physical bounds
//! - `UnknownSensor`: sensor id has no registered position
//! - `QueueFull`: ingestion queue saturated, upstream must retry or drop
//!
//! ### Processing
//! - `LateArrival`: reading for a window bucket that was already emitted
//! - `InsufficientGeometry`: fewer than three distinct non-collinear sensors
//!
//! ### Delivery
//! - `ClientOverloaded`: a subscriber's bounded queue overflowed
//!
//! ## Handling Strategy
//!
//! ```rust
//! use thermoguard_core::{TelemetryError, RejectReason};
//!
//! fn on_reject(err: &TelemetryError) {
//!     match err.reason() {
//!         RejectReason::QueueFull => { /* back off and retry */ }
//!         RejectReason::UnknownSensor => { /* register the sensor first */ }
//!         _ => { /* drop, it is already counted */ }
//!     }
//! }
//! ```

use thiserror_no_std::Error;

use crate::time::Timestamp;

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors produced anywhere in the telemetry pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// Required field missing or malformed
    #[error("Invalid schema: {reason}")]
    InvalidSchema {
        /// Human readable description of the problem
        reason: String,
    },

    /// Value outside the configured physical bounds
    #[error("Value {value} outside range [{min}, {max}]")]
    OutOfRange {
        /// The normalized (Celsius) value that failed
        value: f64,
        /// Lower physical bound
        min: f64,
        /// Upper physical bound
        max: f64,
    },

    /// Sensor id has no registered position
    #[error("Unknown sensor: {sensor_id}")]
    UnknownSensor {
        /// The offending sensor id
        sensor_id: String,
    },

    /// Reading arrived after its window bucket was emitted
    #[error("Late arrival for bucket starting at {bucket_start}")]
    LateArrival {
        /// Start of the bucket the reading belonged to
        bucket_start: Timestamp,
    },

    /// Triangulation impossible with the current sensor layout
    #[error("Insufficient geometry: {distinct} distinct positions, collinear={collinear}")]
    InsufficientGeometry {
        /// Number of distinct sensor positions
        distinct: usize,
        /// Whether all distinct positions lie on one line
        collinear: bool,
    },

    /// Subscriber queue overflowed
    #[error("Client {client_id} overloaded, oldest message dropped")]
    ClientOverloaded {
        /// Client whose queue overflowed
        client_id: String,
    },

    /// Bounded queue saturated
    #[error("Queue full: {stage}")]
    QueueFull {
        /// Stage whose input queue was full
        stage: &'static str,
    },

    /// Configuration failed a consistency check
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl TelemetryError {
    /// Shorthand for schema failures
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            reason: reason.into(),
        }
    }

    /// Counter key for this error
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::InvalidSchema { .. } => RejectReason::InvalidSchema,
            Self::OutOfRange { .. } => RejectReason::OutOfRange,
            Self::UnknownSensor { .. } => RejectReason::UnknownSensor,
            Self::LateArrival { .. } => RejectReason::LateArrival,
            Self::InsufficientGeometry { .. } => RejectReason::InsufficientGeometry,
            Self::ClientOverloaded { .. } => RejectReason::ClientOverloaded,
            Self::QueueFull { .. } => RejectReason::QueueFull,
            Self::InvalidConfig(_) => RejectReason::InvalidConfig,
        }
    }
}

/// Copyable error discriminant, used to index counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum RejectReason {
    InvalidSchema = 0,
    OutOfRange = 1,
    UnknownSensor = 2,
    LateArrival = 3,
    InsufficientGeometry = 4,
    ClientOverloaded = 5,
    QueueFull = 6,
    InvalidConfig = 7,
}

impl RejectReason {
    /// Number of distinct reasons
    pub const COUNT: usize = 8;

    /// All reasons in counter order
    pub const ALL: [RejectReason; Self::COUNT] = [
        RejectReason::InvalidSchema,
        RejectReason::OutOfRange,
        RejectReason::UnknownSensor,
        RejectReason::LateArrival,
        RejectReason::InsufficientGeometry,
        RejectReason::ClientOverloaded,
        RejectReason::QueueFull,
        RejectReason::InvalidConfig,
    ];

    /// Stable name used in logs and metric labels
    pub const fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidSchema => "invalid_schema",
            RejectReason::OutOfRange => "out_of_range",
            RejectReason::UnknownSensor => "unknown_sensor",
            RejectReason::LateArrival => "late_arrival",
            RejectReason::InsufficientGeometry => "insufficient_geometry",
            RejectReason::ClientOverloaded => "client_overloaded",
            RejectReason::QueueFull => "queue_full",
            RejectReason::InvalidConfig => "invalid_config",
        }
    }

    /// Counter slot
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_its_reason() {
        assert_eq!(
            TelemetryError::schema("missing sensorId").reason(),
            RejectReason::InvalidSchema
        );
        assert_eq!(
            TelemetryError::OutOfRange { value: 200.0, min: -50.0, max: 150.0 }.reason(),
            RejectReason::OutOfRange
        );
        assert_eq!(
            TelemetryError::QueueFull { stage: "ingest" }.reason(),
            RejectReason::QueueFull
        );
    }

    #[test]
    fn reason_indices_match_table_order() {
        for (i, reason) in RejectReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }

    #[test]
    fn error_messages_carry_context() {
        let err = TelemetryError::UnknownSensor { sensor_id: "rack-7".into() };
        assert_eq!(err.to_string(), "Unknown sensor: rack-7");
    }
}
