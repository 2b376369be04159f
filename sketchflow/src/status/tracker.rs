//! The run status tracker.
//!
//! One writer (the run task, through its [`RunTicket`]) and any number of
//! pollers share the tracker. Only the latest state is kept.

use super::{ResultQuality, RunState};
use crate::errors::{FailureKind, SketchflowError};
use crate::utils::Timestamp;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct TrackerInner {
    state: RunState,
    running: bool,
    run_id: Option<Uuid>,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    log_path: Option<PathBuf>,
    maintenance: Option<String>,
}

/// A consistent view of the tracker at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Full run state.
    pub state: RunState,
    /// Stage string as reported to pollers.
    pub stage: String,
    /// Whether a run is active.
    pub running: bool,
    /// Id of the latest run.
    pub run_id: Option<Uuid>,
    /// When the latest run started.
    pub started_at: Option<Timestamp>,
    /// When the latest run reached a terminal state.
    pub finished_at: Option<Timestamp>,
    /// Log file of the latest run.
    pub log_path: Option<PathBuf>,
    /// Quality of a completed run.
    pub quality: Option<ResultQuality>,
}

/// Process-wide record of the current run.
#[derive(Debug, Default)]
pub struct RunStatusTracker {
    inner: RwLock<TrackerInner>,
}

impl RunStatusTracker {
    /// Creates a tracker in the `not_started` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current stage string (`not_started`, a stage id, `completed`,
    /// or `error:<stage>`).
    #[must_use]
    pub fn get_stage(&self) -> String {
        self.inner.read().state.to_string()
    }

    /// The current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.read().state.clone()
    }

    /// Returns true while a run holds the ticket.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.read().running
    }

    /// The maintenance operation holding the namespace, if any.
    #[must_use]
    pub fn maintenance(&self) -> Option<String> {
        self.inner.read().maintenance.clone()
    }

    /// Returns true while a run or a maintenance operation holds the
    /// namespace.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.read();
        inner.running || inner.maintenance.is_some()
    }

    /// Reads every field under one lock.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            stage: inner.state.to_string(),
            quality: inner.state.quality(),
            state: inner.state.clone(),
            running: inner.running,
            run_id: inner.run_id,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            log_path: inner.log_path.clone(),
        }
    }

    /// Claims the run singleton.
    ///
    /// The check and the set happen under one write lock, so of several
    /// concurrent callers exactly one receives a ticket.
    pub fn try_begin(self: &Arc<Self>) -> Result<RunTicket, SketchflowError> {
        let mut inner = self.inner.write();
        inner.ensure_idle()?;

        let run_id = Uuid::new_v4();
        *inner = TrackerInner {
            state: RunState::NotStarted,
            running: true,
            run_id: Some(run_id),
            started_at: Some(Utc::now()),
            finished_at: None,
            log_path: None,
            maintenance: None,
        };
        debug!(%run_id, "Run ticket issued");

        Ok(RunTicket {
            tracker: Arc::clone(self),
            run_id,
            finished: false,
        })
    }

    /// Claims the namespace for a maintenance operation such as cleanup.
    ///
    /// Uses the same write lock as [`try_begin`](Self::try_begin): while the
    /// guard lives no run can start, and no guard is issued during a run.
    pub fn try_begin_maintenance(
        self: &Arc<Self>,
        operation: &str,
    ) -> Result<MaintenanceGuard, SketchflowError> {
        let mut inner = self.inner.write();
        inner.ensure_idle()?;
        inner.maintenance = Some(operation.to_string());
        debug!(operation, "Maintenance claim issued");
        Ok(MaintenanceGuard {
            tracker: Arc::clone(self),
        })
    }
}

impl TrackerInner {
    fn ensure_idle(&self) -> Result<(), SketchflowError> {
        if self.running {
            return Err(SketchflowError::ConcurrencyConflict(format!(
                "run {} is still active",
                self.run_id.map(|id| id.to_string()).unwrap_or_default()
            )));
        }
        if let Some(operation) = &self.maintenance {
            return Err(SketchflowError::MaintenanceInProgress(operation.clone()));
        }
        Ok(())
    }
}

/// Exclusive hold on the namespace for a maintenance operation.
///
/// Released on drop.
#[derive(Debug)]
pub struct MaintenanceGuard {
    tracker: Arc<RunStatusTracker>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.tracker.inner.write().maintenance = None;
    }
}

/// Exclusive write access to the tracker for one run.
///
/// Dropping the ticket releases the running flag. A ticket dropped before
/// `complete` or `fail` marks the run as failed at its current stage.
#[derive(Debug)]
pub struct RunTicket {
    tracker: Arc<RunStatusTracker>,
    run_id: Uuid,
    finished: bool,
}

impl RunTicket {
    /// The run this ticket belongs to.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Publishes the executing stage.
    pub fn set_stage(&self, stage: &str) {
        self.tracker.inner.write().state = RunState::Running {
            stage: stage.to_string(),
        };
    }

    /// Records the run log location.
    pub fn set_log_path(&self, path: PathBuf) {
        self.tracker.inner.write().log_path = Some(path);
    }

    /// Marks the run completed and releases the singleton.
    pub fn complete(mut self, quality: ResultQuality) {
        self.finish(RunState::Completed { quality });
    }

    /// Marks the run failed at `stage` and releases the singleton.
    pub fn fail(mut self, stage: &str, kind: FailureKind, message: impl Into<String>) {
        self.finish(RunState::Error {
            stage: stage.to_string(),
            kind,
            message: message.into(),
        });
    }

    fn finish(&mut self, state: RunState) {
        let mut inner = self.tracker.inner.write();
        inner.state = state;
        inner.running = false;
        inner.finished_at = Some(Utc::now());
        self.finished = true;
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let stage = {
            let inner = self.tracker.inner.read();
            match &inner.state {
                RunState::Running { stage } => stage.clone(),
                _ => "not_started".to_string(),
            }
        };
        warn!(run_id = %self.run_id, %stage, "Run ended without a terminal state");
        self.finish(RunState::Error {
            stage,
            kind: FailureKind::Cancelled,
            message: "run task ended unexpectedly".to_string(),
        });
    }
}
