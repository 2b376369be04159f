//! Stage pipeline orchestration.
//!
//! Stages run strictly in configured order as external processes, each
//! with the project root as working directory. The first failing stage
//! ends the run; there are no retries and no partial resume.

mod log;
mod orchestrator;
mod runner;

#[cfg(all(test, unix))]
mod integration_tests;

pub use log::{latest_log, RunLog, LOG_PREFIX};
pub use orchestrator::{inspect_terminal, Orchestrator, RunReport, StageOutcome};
pub use runner::{
    ProcessStageRunner, StageExecution, StageExit, StageInvocation, StageRunner,
};
