//! Structured validation reports
//!
//! Decoding an ingestion message collects every problem it finds instead of
//! stopping at the first one, so a misbehaving collector gets one complete
//! answer per message. Errors make the message invalid; warnings and info
//! entries are advisory and travel alongside an accepted reading.

use core::fmt;

use serde::Serialize;

use thermoguard_core::{RejectReason, TelemetryError};

/// Outcome of checking one message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    pub fn add_warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn add_info(&mut self, issue: ValidationIssue) {
        self.info.push(issue);
    }

    /// Shorthand for an error on a named field
    pub fn error(&mut self, issue_type: IssueType, field: &str, message: impl Into<String>) {
        self.add_error(ValidationIssue::new(issue_type, Some(field), message, Level::Error));
    }

    /// Shorthand for a warning on a named field
    pub fn warn(&mut self, issue_type: IssueType, field: &str, message: impl Into<String>) {
        self.add_warning(ValidationIssue::new(issue_type, Some(field), message, Level::Warning));
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_issues(&self) -> usize {
        self.errors.len() + self.warnings.len() + self.info.len()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }

    /// Report describing a pipeline rejection
    pub fn from_telemetry_error(error: &TelemetryError) -> Self {
        let mut report = Self::new();
        let (issue_type, field) = match error.reason() {
            RejectReason::InvalidSchema => (IssueType::MalformedField, None),
            RejectReason::OutOfRange => (IssueType::PhysicsViolation, Some("value")),
            RejectReason::UnknownSensor => (IssueType::UnknownSensor, Some("sensorId")),
            RejectReason::LateArrival => (IssueType::LateArrival, Some("timestamp")),
            RejectReason::InsufficientGeometry => (IssueType::Geometry, Some("position")),
            RejectReason::ClientOverloaded
            | RejectReason::QueueFull
            | RejectReason::InvalidConfig => (IssueType::Capacity, None),
        };
        report.add_error(ValidationIssue::new(issue_type, field, error.to_string(), Level::Error));
        report
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "valid ({} warnings)", self.warnings.len());
        }
        for (i, issue) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

/// One problem found in a message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub issue_type: IssueType,
    /// Wire name of the offending field, if the issue is about one
    pub field: Option<String>,
    pub message: String,
    pub level: Level,
}

impl ValidationIssue {
    pub fn new(
        issue_type: IssueType,
        field: Option<&str>,
        message: impl Into<String>,
        level: Level,
    ) -> Self {
        Self {
            issue_type,
            field: field.map(str::to_string),
            message: message.into(),
            level,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Issue categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueType {
    /// Message is not a JSON object
    NotAnObject,
    MissingField,
    TypeMismatch,
    /// Right type, unusable content (empty id, NaN, quality outside [0, 1])
    MalformedField,
    UnknownUnit,
    /// Outside the absolute temperature limits
    PhysicsViolation,
    /// Plausible but outside the typical band of the site profile
    UnusualValue,
    /// Faster change than the site profile allows
    RateOfChange,
    UnknownSensor,
    LateArrival,
    Geometry,
    /// Queue or client capacity exhausted
    Capacity,
    UnknownField,
}

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}
