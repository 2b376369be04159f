//! Sequential, fail-fast stage execution.

use super::log::RunLog;
use super::runner::{StageExit, StageInvocation, StageRunner};
use crate::cancellation::CancellationToken;
use crate::channel::{ChannelNamespace, ChannelReader, SchemaRegistry};
use crate::config::{PipelineConfig, StageDefinition, TerminalConfig};
use crate::errors::{FailureKind, SketchflowError, StageFailure};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::status::{ResultQuality, RunState, RunTicket, TerminalCheck};
use serde::Serialize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened to one executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    /// Stage id.
    pub stage: String,
    /// Value of the `[EXIT CODE]` log line.
    pub exit: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: Uuid,
    /// The run's log file.
    pub log_path: PathBuf,
    /// Stages that were launched, in order.
    pub outcomes: Vec<StageOutcome>,
    /// Terminal state.
    pub state: RunState,
    /// Quality of a completed run.
    pub quality: Option<ResultQuality>,
    /// Terminal artifact verdict of a completed run.
    pub terminal: Option<TerminalCheck>,
}

impl RunReport {
    /// Returns true when every stage succeeded.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// The failing stage of an errored run.
    #[must_use]
    pub fn failure(&self) -> Option<StageFailure> {
        match &self.state {
            RunState::Error { stage, kind, .. } => {
                Some(StageFailure::new(stage.clone(), kind.clone()))
            }
            _ => None,
        }
    }
}

/// Inspects the terminal artifact without failing the run.
#[must_use]
pub fn inspect_terminal(config: &TerminalConfig, path: &Path) -> TerminalCheck {
    let Ok(file) = std::fs::File::open(path) else {
        return TerminalCheck::Missing;
    };
    let mut prefix = Vec::with_capacity(config.inspect_bytes);
    if file
        .take(config.inspect_bytes as u64)
        .read_to_end(&mut prefix)
        .is_err()
    {
        return TerminalCheck::Missing;
    }
    if prefix.is_empty() {
        return TerminalCheck::Empty;
    }
    let sentinel = config.sentinel.as_bytes();
    if !sentinel.is_empty() && prefix.windows(sentinel.len()).any(|w| w == sentinel) {
        return TerminalCheck::Sentinel;
    }
    TerminalCheck::Ok
}

/// Drives the configured stages for one run.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn StageRunner>,
    reader: ChannelReader,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.config.stages.len())
            .field("namespace", &self.config.namespace_root())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with the configured channel contracts.
    #[must_use]
    pub fn new(config: Arc<PipelineConfig>, runner: Arc<dyn StageRunner>) -> Self {
        let registry = Arc::new(SchemaRegistry::from_contracts(config.channels.clone()));
        let reader = ChannelReader::new(ChannelNamespace::new(config.namespace_root()), registry);
        Self {
            config,
            runner,
            reader,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Executes every stage in order, stopping at the first failure.
    ///
    /// Stage failures are reported through the ticket and the returned
    /// report. `Err` is reserved for run log I/O problems.
    pub async fn run(
        &self,
        ticket: RunTicket,
        cancel: Arc<CancellationToken>,
        input_digest: Option<String>,
    ) -> Result<RunReport, SketchflowError> {
        let run_id = ticket.run_id();
        let mut log =
            RunLog::create(&self.config.log_dir(), run_id, input_digest.as_deref()).await?;
        ticket.set_log_path(log.path().to_path_buf());

        info!(
            %run_id,
            log_path = %log.path().display(),
            stages = self.config.stages.len(),
            "Run started"
        );
        self.events
            .emit(
                names::RUN_STARTED,
                Some(json!({"run_id": run_id, "log_path": log.path().display().to_string()})),
            )
            .await;

        let mut outcomes = Vec::with_capacity(self.config.stages.len());

        for stage in &self.config.stages {
            ticket.set_stage(&stage.id);
            log.stage_header(&stage.id, &stage.command_line()).await?;

            if cancel.is_cancelled() {
                log.stage_output("", "cancelled").await?;
                return self
                    .fail(ticket, &mut log, outcomes, stage, FailureKind::Cancelled)
                    .await;
            }

            if let Err(kind) = self.check_inputs(stage, &mut log).await? {
                return self.fail(ticket, &mut log, outcomes, stage, kind).await;
            }

            self.events
                .emit(
                    names::STAGE_STARTED,
                    Some(json!({"run_id": run_id, "stage": stage.id})),
                )
                .await;
            info!(%run_id, stage = %stage.id, "Stage started");

            let invocation = StageInvocation {
                stage_id: stage.id.clone(),
                command: stage.command.clone(),
                working_dir: self.config.project_root.clone(),
                timeout: self.config.stage_timeout(stage),
            };

            let execution = match self.runner.run(invocation, Arc::clone(&cancel)).await {
                Ok(execution) => execution,
                Err(e) => {
                    log.stage_output(&format!("[SPAWN ERROR] {e}"), "none").await?;
                    let kind = FailureKind::SpawnFailed(e.to_string());
                    return self.fail(ticket, &mut log, outcomes, stage, kind).await;
                }
            };

            log.stage_output(&execution.output, &execution.exit.log_code())
                .await?;
            outcomes.push(StageOutcome {
                stage: stage.id.clone(),
                exit: execution.exit.log_code(),
                duration_ms: execution.duration_ms,
            });

            let kind = match execution.exit {
                StageExit::Code(0) => None,
                StageExit::Code(code) => Some(FailureKind::NonZeroExit(code)),
                StageExit::Signalled => Some(FailureKind::Signalled),
                StageExit::TimedOut(limit) => Some(FailureKind::Timeout(limit.as_secs())),
                StageExit::Cancelled => Some(FailureKind::Cancelled),
            };
            if let Some(kind) = kind {
                return self.fail(ticket, &mut log, outcomes, stage, kind).await;
            }

            log.stage_finished(&stage.id).await?;
            info!(
                %run_id,
                stage = %stage.id,
                duration_ms = execution.duration_ms,
                "Stage completed"
            );
            self.events
                .emit(
                    names::STAGE_COMPLETED,
                    Some(json!({
                        "run_id": run_id,
                        "stage": stage.id,
                        "duration_ms": execution.duration_ms,
                    })),
                )
                .await;
        }

        let artifact = self.config.terminal_artifact();
        let terminal = inspect_terminal(&self.config.terminal, &artifact);
        log.terminal_verdict(terminal, &artifact).await?;
        let quality = terminal.quality();
        if quality == ResultQuality::Degraded {
            warn!(%run_id, terminal = %terminal, "Run completed with a degraded result");
        }

        ticket.complete(quality);
        info!(%run_id, %quality, "Run completed");
        self.events
            .emit(
                names::RUN_COMPLETED,
                Some(json!({"run_id": run_id, "quality": quality, "terminal": terminal})),
            )
            .await;

        Ok(RunReport {
            run_id,
            log_path: log.path().to_path_buf(),
            outcomes,
            state: RunState::Completed { quality },
            quality: Some(quality),
            terminal: Some(terminal),
        })
    }

    /// Validates the channels a stage reads.
    ///
    /// The inner `Err` carries the failure of an abort-policy violation.
    async fn check_inputs(
        &self,
        stage: &StageDefinition,
        log: &mut RunLog,
    ) -> Result<Result<(), FailureKind>, SketchflowError> {
        for channel in &stage.reads {
            match self.reader.check_channel(channel) {
                Ok(check) => {
                    for violation in check.tolerated {
                        log.note(&violation.to_string()).await?;
                        self.events
                            .emit(
                                names::STAGE_SCHEMA_VIOLATION,
                                Some(json!({
                                    "stage": stage.id,
                                    "channel": violation.channel,
                                    "artifact": violation.artifact,
                                    "violations": violation.violations,
                                })),
                            )
                            .await;
                    }
                }
                Err(SketchflowError::SchemaViolation(violation)) => {
                    log.stage_output(&format!("[SCHEMA] {violation}"), "none")
                        .await?;
                    return Ok(Err(FailureKind::SchemaViolation(violation.to_string())));
                }
                Err(e) => {
                    warn!(
                        stage = %stage.id,
                        channel = %channel,
                        error = %e,
                        "Could not check input channel"
                    );
                }
            }
        }
        Ok(Ok(()))
    }

    async fn fail(
        &self,
        ticket: RunTicket,
        log: &mut RunLog,
        outcomes: Vec<StageOutcome>,
        stage: &StageDefinition,
        kind: FailureKind,
    ) -> Result<RunReport, SketchflowError> {
        let run_id = ticket.run_id();
        let message = kind.to_string();
        log.stage_failed(&stage.id, &message).await?;
        error!(%run_id, stage = %stage.id, error = %message, "Stage failed");

        let failure = json!({"run_id": run_id, "stage": stage.id, "error": kind});
        self.events
            .emit(names::STAGE_FAILED, Some(failure.clone()))
            .await;
        ticket.fail(&stage.id, kind.clone(), message.clone());
        self.events.emit(names::RUN_FAILED, Some(failure)).await;

        Ok(RunReport {
            run_id,
            log_path: log.path().to_path_buf(),
            outcomes,
            state: RunState::Error {
                stage: stage.id.clone(),
                kind,
                message,
            },
            quality: None,
            terminal: None,
        })
    }
}
