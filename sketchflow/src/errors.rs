//! Error types for the sketchflow pipeline.
//!
//! The taxonomy follows the run lifecycle: upload rejections, stage
//! execution failures, schema violations on channel reads, concurrency
//! conflicts on the run singleton, and retention I/O problems.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for sketchflow operations.
#[derive(Debug, Error)]
pub enum SketchflowError {
    /// The pipeline configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An upload was rejected by the input gate.
    #[error("{0}")]
    Validation(#[from] RejectionReason),

    /// A stage subprocess failed.
    #[error("{0}")]
    StageExecution(#[from] StageFailure),

    /// A consumer read a channel artifact that violates its contract.
    #[error("{0}")]
    SchemaViolation(#[from] SchemaViolation),

    /// An artifact name would escape its channel directory.
    #[error("Invalid artifact path: {0}")]
    InvalidArtifact(String),

    /// A second run was requested while one is active.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A cleanup or history wipe holds the namespace.
    #[error("Maintenance in progress: {0}")]
    MaintenanceInProgress(String),

    /// A run was requested while the input slot is empty.
    #[error("No input artifact at {}", .0.display())]
    MissingInput(PathBuf),

    /// The requested result is not available yet.
    #[error("Result not ready: {0}")]
    NotReady(String),

    /// A destructive operation was not confirmed properly.
    #[error("Confirmation failed: {0}")]
    Confirmation(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SketchflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl SketchflowError {
    /// Stable machine-readable code for boundary responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Validation(reason) => reason.code(),
            Self::StageExecution(_) => "stage_execution_error",
            Self::SchemaViolation(_) => "schema_violation",
            Self::InvalidArtifact(_) => "invalid_artifact",
            Self::ConcurrencyConflict(_) => "already_running",
            Self::MaintenanceInProgress(_) => "maintenance_in_progress",
            Self::MissingInput(_) => "missing_input",
            Self::NotReady(_) => "not_ready",
            Self::Confirmation(_) => "confirmation_failed",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Why the input gate refused an upload.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The source file does not exist.
    #[error("Image not found: {}", .path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The artifact is not a decodable image container.
    #[error("Uploaded file is not a valid image format.")]
    InvalidFormat {
        /// Decoder error text.
        detail: String,
    },

    /// The artifact is (almost) blank.
    #[error("Uploaded image is mostly white or empty ({non_blank_percent:.2}% non-white pixels).")]
    EmptyContent {
        /// Percentage of pixels below the brightness threshold.
        non_blank_percent: f64,
    },

    /// The artifact is below the resolution floor.
    #[error("Uploaded image resolution is too small ({width}x{height}). Minimum {min_width}x{min_height} required.")]
    TooSmall {
        /// Actual width.
        width: u32,
        /// Actual height.
        height: u32,
        /// Required width.
        min_width: u32,
        /// Required height.
        min_height: u32,
    },

    /// The canonical input slot is in use by an active run.
    #[error("An analysis run is in progress; the input slot cannot be replaced.")]
    RunInProgress,
}

impl RejectionReason {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidFormat { .. } => "invalid_format",
            Self::EmptyContent { .. } => "empty_content",
            Self::TooSmall { .. } => "too_small",
            Self::RunInProgress => "run_in_progress",
        }
    }
}

/// How a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The process exited with a non-zero status.
    NonZeroExit(i32),
    /// The process was terminated by a signal.
    Signalled,
    /// The process could not be started.
    SpawnFailed(String),
    /// The stage exceeded its deadline and was killed.
    Timeout(u64),
    /// The run was cancelled while the stage was executing.
    Cancelled,
    /// An input channel violated an abort-policy contract.
    SchemaViolation(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "exited with code {code}"),
            Self::Signalled => write!(f, "terminated by signal"),
            Self::SpawnFailed(msg) => write!(f, "failed to start: {msg}"),
            Self::Timeout(secs) => write!(f, "timed out after {secs}s"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SchemaViolation(msg) => write!(f, "input schema violation: {msg}"),
        }
    }
}

/// A stage subprocess failure. Fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Stage '{stage}' {kind}")]
pub struct StageFailure {
    /// The failing stage id.
    pub stage: String,
    /// What went wrong.
    pub kind: FailureKind,
}

impl StageFailure {
    /// Creates a new stage failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            stage: stage.into(),
            kind,
        }
    }

    /// Returns true when the stage was killed for exceeding its deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout(_))
    }
}

/// A channel artifact did not match the schema registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Schema violation in {channel}/{artifact}: {}", .violations.join("; "))]
pub struct SchemaViolation {
    /// The channel name.
    pub channel: String,
    /// Artifact path relative to the channel.
    pub artifact: String,
    /// Individual violation messages (`<pointer>: <problem>`).
    pub violations: Vec<String>,
}

impl SchemaViolation {
    /// Creates a new schema violation.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        artifact: impl Into<String>,
        violations: Vec<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            artifact: artifact.into(),
            violations,
        }
    }
}

/// A retention operation could not process one item.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Retention I/O error on {}: {message}", .path.display())]
pub struct RetentionIoError {
    /// The item that was skipped.
    pub path: PathBuf,
    /// The underlying error text.
    pub message: String,
}

impl RetentionIoError {
    /// Creates a new retention error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}
