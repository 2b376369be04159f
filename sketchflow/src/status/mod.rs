//! Run state values and the process-wide status tracker.

mod tracker;

pub use tracker::{MaintenanceGuard, RunStatusTracker, RunTicket, StatusSnapshot};

use crate::config::StageDefinition;
use crate::errors::FailureKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome quality of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultQuality {
    /// The terminal artifact looked sound.
    #[default]
    Ok,
    /// The run completed but the terminal artifact is missing, empty or a
    /// fallback document.
    Degraded,
}

impl fmt::Display for ResultQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Verdict of the final terminal artifact inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalCheck {
    /// Present, non-empty and free of the failure sentinel.
    Ok,
    /// Present but carrying the failure sentinel.
    Sentinel,
    /// Not produced.
    Missing,
    /// Produced with zero bytes.
    Empty,
}

impl TerminalCheck {
    /// Quality implied by this verdict.
    #[must_use]
    pub fn quality(self) -> ResultQuality {
        match self {
            Self::Ok => ResultQuality::Ok,
            Self::Sentinel | Self::Missing | Self::Empty => ResultQuality::Degraded,
        }
    }
}

impl fmt::Display for TerminalCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Sentinel => write!(f, "sentinel"),
            Self::Missing => write!(f, "missing"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// The state of the (single) pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// No stage has started yet.
    #[default]
    NotStarted,
    /// A stage is executing.
    Running {
        /// The executing stage id.
        stage: String,
    },
    /// Every stage finished.
    Completed {
        /// Terminal artifact quality.
        quality: ResultQuality,
    },
    /// A stage failed and the remaining stages were skipped.
    Error {
        /// The failing stage id.
        stage: String,
        /// How it failed.
        kind: FailureKind,
        /// Human-readable failure text.
        message: String,
    },
}

impl RunState {
    /// Returns true for `completed` and `error` states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    /// Returns true for the `completed` state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// The executing stage, if any.
    #[must_use]
    pub fn current_stage(&self) -> Option<&str> {
        match self {
            Self::Running { stage } => Some(stage),
            _ => None,
        }
    }

    /// Quality of a completed run.
    #[must_use]
    pub fn quality(&self) -> Option<ResultQuality> {
        match self {
            Self::Completed { quality } => Some(*quality),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running { stage } => write!(f, "{stage}"),
            Self::Completed { .. } => write!(f, "completed"),
            Self::Error { stage, .. } => write!(f, "error:{stage}"),
        }
    }
}

/// Progress text for pollers.
#[must_use]
pub fn describe_stage(state: &RunState, stages: &[StageDefinition]) -> String {
    match state {
        RunState::NotStarted => "Starting analysis...".to_string(),
        RunState::Running { stage } => stages
            .iter()
            .find(|s| &s.id == stage)
            .and_then(|s| s.description.clone())
            .unwrap_or_else(|| "Processing...".to_string()),
        RunState::Completed { .. } => "Analysis complete. Report is ready!".to_string(),
        RunState::Error { stage, message, .. } => format!("Error in {stage}: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::NotStarted.to_string(), "not_started");
        assert_eq!(
            RunState::Running { stage: "run_FED".into() }.to_string(),
            "run_FED"
        );
        assert_eq!(
            RunState::Completed { quality: ResultQuality::Degraded }.to_string(),
            "completed"
        );
        let err = RunState::Error {
            stage: "stage-3".into(),
            kind: FailureKind::NonZeroExit(1),
            message: "exited with code 1".into(),
        };
        assert_eq!(err.to_string(), "error:stage-3");
        assert!(err.is_terminal());
    }

    #[test]
    fn test_terminal_check_quality() {
        assert_eq!(TerminalCheck::Ok.quality(), ResultQuality::Ok);
        assert_eq!(TerminalCheck::Sentinel.quality(), ResultQuality::Degraded);
        assert_eq!(TerminalCheck::Empty.quality(), ResultQuality::Degraded);
    }

    #[test]
    fn test_describe_stage() {
        let stages = vec![
            StageDefinition::new("run_OBJ_DET", ["true"], "2_OBJ_DET_out")
                .with_description("Detecting objects in the drawing..."),
            StageDefinition::new("bare", ["true"], "x"),
        ];
        let running = |id: &str| RunState::Running { stage: id.to_string() };

        assert_eq!(
            describe_stage(&running("run_OBJ_DET"), &stages),
            "Detecting objects in the drawing..."
        );
        assert_eq!(describe_stage(&running("bare"), &stages), "Processing...");
        assert_eq!(
            describe_stage(&RunState::Completed { quality: ResultQuality::Ok }, &stages),
            "Analysis complete. Report is ready!"
        );
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(RunState::Running { stage: "a".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "stage": "a"}));
    }
}
