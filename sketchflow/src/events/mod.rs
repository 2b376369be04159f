//! Run lifecycle events.
//!
//! The orchestrator reports progress to an [`EventSink`]. Event names are
//! collected in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the orchestrator.
pub mod names {
    /// A run acquired the singleton and opened its log.
    pub const RUN_STARTED: &str = "run.started";
    /// A stage process is about to be launched.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage process exited with code 0.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed; the run stops.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage input violated a tolerate-policy contract.
    pub const STAGE_SCHEMA_VIOLATION: &str = "stage.schema_violation";
    /// Every stage finished.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// The run ended in an error state.
    pub const RUN_FAILED: &str = "run.failed";
}
