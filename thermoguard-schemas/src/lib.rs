//! Wire Formats for ThermoGuard
//!
//! ## Overview
//!
//! Everything that crosses the pipeline boundary as JSON is defined here:
//!
//! ```text
//!   collectors ── IngestMessage ──→ IngestDecoder ──→ RawReading ──→ core validator
//!
//!   pipeline ──── DerivedEvent ───→ EventEnvelope ──→ subscribers
//!
//!   subscribers ─ ControlMessage ─→ SubscriptionFilter ──→ fan-out
//! ```
//!
//! The core crate knows nothing about JSON field names; this crate owns
//! them. Decoding is deliberately lenient in what it *reports* and strict in
//! what it *accepts*: every structural problem in a message is collected
//! into one [`ValidationReport`], and any error rejects the message.
//!
//! ## Temperature Constraints
//!
//! [`TemperatureConstraints`] describe a site profile with an absolute band
//! (hard physical limits, enforced by the core validator once applied to its
//! config) and a typical band (advisory). An [`IngestDecoder`] with
//! constraints attached annotates readings that are plausible but unusual,
//! or that change faster than the profile allows.
//!
//! | Profile | Absolute (°C) | Typical (°C) | Max rate (°C/s) |
//! |---------|---------------|--------------|-----------------|
//! | `general` | -50 … 150 | -20 … 85 | 10 |
//! | `data_hall` | -10 … 80 | 15 … 32 | 1 |
//! | `cold_storage` | -60 … 40 | -30 … 8 | 0.5 |
//!
//! ## Example
//!
//! ```no_run
//! use thermoguard_schemas::{ControlMessage, IngestDecoder, TemperatureConstraints};
//!
//! let decoder = IngestDecoder::new().with_constraints(TemperatureConstraints::data_hall());
//! let decoded = decoder.decode_str(
//!     r#"{"sensorId":"rack-07","timestamp":0,"value":24.6,"unit":"celsius","zoneId":"a"}"#,
//! )?;
//! for warning in &decoded.report.warnings {
//!     println!("{}", warning);
//! }
//!
//! let filter = ControlMessage::parse(r#"{"action":"subscribe","topics":["alerts"]}"#)?
//!     .subscription()?;
//! println!("{} topics", filter.topics.len());
//! # Ok::<(), thermoguard_schemas::SchemaError>(())
//! ```

#![deny(unsafe_code)]

use thiserror_no_std::Error;

use thermoguard_core::TelemetryError;

pub mod control;
pub mod envelope;
pub mod ingest;
pub mod physics;
pub mod validation;

pub use control::{ControlAction, ControlMessage, Filters, SubscriptionFilter};
pub use envelope::EventEnvelope;
pub use ingest::{Decoded, IngestDecoder, IngestMessage};
pub use physics::TemperatureConstraints;
pub use validation::{IssueType, Level, ValidationIssue, ValidationReport};

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Not JSON, or JSON of the wrong overall shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed JSON that fails structural checks
    #[error("Invalid message: {0}")]
    Invalid(ValidationReport),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Unknown severity: {0}")]
    UnknownSeverity(String),
}

impl From<SchemaError> for TelemetryError {
    fn from(err: SchemaError) -> Self {
        TelemetryError::schema(err.to_string())
    }
}
