//! The boundary service.
//!
//! [`PipelineService`] composes the gate, tracker, orchestrator and
//! retention manager behind the operations exposed to the HTTP layer and
//! the CLI. It is the only owner of the active run handle, so the
//! single-run rule is enforced here and in the tracker's ticket.
//!
//! Slot writes, run claims and maintenance claims are serialised by one
//! slot lock: an upload can never replace the input between the digest a
//! run records and the stages reading it, and cleanup can never start
//! under a running pipeline.

use crate::bundle::ResultBundle;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{RejectionReason, SketchflowError};
use crate::events::{EventSink, LoggingEventSink};
use crate::gate::{AcceptedArtifact, InputGate};
use crate::pipeline::{latest_log, Orchestrator, ProcessStageRunner, RunReport, StageRunner};
use crate::retention::{ArchiveReport, PurgeReport, RetentionManager};
use crate::status::{
    describe_stage, MaintenanceGuard, ResultQuality, RunState, RunStatusTracker, RunTicket,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Phrase that must be typed to confirm a history wipe.
pub const WIPE_PHRASE: &str = "DELETE ALL HISTORY";

/// Lifetime of a history wipe challenge in seconds.
pub const WIPE_CHALLENGE_TTL_SECS: i64 = 300;

/// Number of trailing log bytes returned with an error status.
const LOG_TAIL_BYTES: usize = 1000;

/// Response to an upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmitResponse {
    /// Whether the image now occupies the input slot.
    pub accepted: bool,
    /// Machine-readable rejection code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable rejection text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Details of the admitted image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<AcceptedArtifact>,
}

impl AdmitResponse {
    fn rejected(err: &SketchflowError) -> Self {
        Self {
            accepted: false,
            reason: Some(err.code().to_string()),
            message: Some(err.to_string()),
            artifact: None,
        }
    }
}

/// Response to a run trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResponse {
    /// Whether a run was launched.
    pub started: bool,
    /// `already_running`, `maintenance_in_progress` or `missing_input`
    /// when not started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Id of the launched run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl StartResponse {
    fn refused(reason: &str) -> Self {
        Self {
            started: false,
            reason: Some(reason.to_string()),
            run_id: None,
        }
    }
}

/// Response to a status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    /// `not_started`, a stage id, `completed` or `error:<stage>`.
    pub stage: String,
    /// Whether a run is active.
    pub running: bool,
    /// Human progress text.
    pub description: String,
    /// Quality of a completed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<ResultQuality>,
    /// Latest run id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Latest run log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Failure text of an errored run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tail of the run log of an errored run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
}

/// Result of archive plus purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Snapshot step.
    pub archive: ArchiveReport,
    /// Purge step.
    pub purge: PurgeReport,
}

/// First step of a history wipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeChallenge {
    /// Single-use confirmation token.
    pub token: Uuid,
    /// Phrase the caller must type back.
    pub phrase: String,
    /// Instant after which the token is void.
    pub expires_at: DateTime<Utc>,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: Arc<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Boundary operations over one pipeline deployment.
pub struct PipelineService {
    config: Arc<PipelineConfig>,
    gate: InputGate,
    tracker: Arc<RunStatusTracker>,
    orchestrator: Arc<Orchestrator>,
    retention: RetentionManager,
    active: Arc<Mutex<Option<ActiveRun>>>,
    slot_lock: Mutex<()>,
    last_report: Arc<RwLock<Option<RunReport>>>,
    challenges: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    wipe_ttl: ChronoDuration,
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("namespace", &self.config.namespace_root())
            .field("running", &self.tracker.is_running())
            .finish_non_exhaustive()
    }
}

impl PipelineService {
    /// Creates a service that runs stages as real processes.
    pub fn new(config: PipelineConfig) -> Result<Self, SketchflowError> {
        Self::with_runner(
            config,
            Arc::new(ProcessStageRunner::new()),
            Arc::new(LoggingEventSink::default()),
        )
    }

    /// Creates a service with a custom stage runner and event sink.
    pub fn with_runner(
        config: PipelineConfig,
        runner: Arc<dyn StageRunner>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SketchflowError> {
        config.validate()?;
        let config = Arc::new(config);
        let orchestrator = Orchestrator::new(Arc::clone(&config), runner).with_event_sink(events);

        Ok(Self {
            gate: InputGate::new(config.gate, config.input_slot()),
            retention: RetentionManager::from_config(&config),
            tracker: Arc::new(RunStatusTracker::new()),
            orchestrator: Arc::new(orchestrator),
            active: Arc::new(Mutex::new(None)),
            slot_lock: Mutex::new(()),
            last_report: Arc::new(RwLock::new(None)),
            challenges: Mutex::new(HashMap::new()),
            wipe_ttl: ChronoDuration::seconds(WIPE_CHALLENGE_TTL_SECS),
            config,
        })
    }

    /// Overrides the history wipe challenge lifetime.
    #[must_use]
    pub fn with_wipe_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.wipe_ttl = ttl;
        self
    }

    /// The pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The status tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<RunStatusTracker> {
        &self.tracker
    }

    /// Report of the latest finished run.
    #[must_use]
    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().clone()
    }

    /// Validates uploaded bytes and stores them in the input slot.
    pub fn admit_upload(&self, bytes: &[u8]) -> AdmitResponse {
        respond(self.admit_checked(bytes))
    }

    /// Validates an image file and copies it into the input slot.
    pub fn admit_path(&self, path: &Path) -> AdmitResponse {
        respond(InputGate::load(path).and_then(|bytes| self.admit_checked(&bytes)))
    }

    fn admit_checked(&self, bytes: &[u8]) -> Result<AcceptedArtifact, SketchflowError> {
        // Skip decoding when the answer is already known.
        self.ensure_slot_writable()?;
        let inspection = self.gate.check(bytes)?;

        let _slot = self.slot_lock.lock();
        self.ensure_slot_writable()?;
        self.gate.commit(bytes, inspection)
    }

    fn ensure_slot_writable(&self) -> Result<(), SketchflowError> {
        if self.tracker.is_running() {
            return Err(RejectionReason::RunInProgress.into());
        }
        if let Some(operation) = self.tracker.maintenance() {
            return Err(SketchflowError::MaintenanceInProgress(operation));
        }
        Ok(())
    }

    /// Hashes the input slot and claims the run singleton in one step.
    fn claim_run(&self) -> Result<(RunTicket, String), SketchflowError> {
        let _slot = self.slot_lock.lock();
        if let Some(operation) = self.tracker.maintenance() {
            return Err(SketchflowError::MaintenanceInProgress(operation));
        }
        if self.tracker.is_running() {
            return Err(SketchflowError::ConcurrencyConflict(
                "a run is already active".to_string(),
            ));
        }
        let digest = self
            .input_digest()
            .ok_or_else(|| SketchflowError::MissingInput(self.config.input_slot()))?;
        let ticket = self.tracker.try_begin()?;
        Ok((ticket, digest))
    }

    fn claim_maintenance(&self, operation: &str) -> Result<MaintenanceGuard, SketchflowError> {
        let _slot = self.slot_lock.lock();
        self.tracker.try_begin_maintenance(operation)
    }

    /// Launches a run in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_run(&self) -> StartResponse {
        let (ticket, digest) = match self.claim_run() {
            Ok(claim) => claim,
            Err(e) => return StartResponse::refused(e.code()),
        };

        let run_id = ticket.run_id();
        let cancel = Arc::new(CancellationToken::new());
        let orchestrator = Arc::clone(&self.orchestrator);
        let last_report = Arc::clone(&self.last_report);
        let active = Arc::clone(&self.active);

        // Hold the slot before spawning so the task cannot clear it first.
        let mut slot = self.active.lock();
        let task_cancel = Arc::clone(&cancel);
        let handle = tokio::spawn(async move {
            match orchestrator.run(ticket, task_cancel, Some(digest)).await {
                Ok(report) => *last_report.write() = Some(report),
                Err(e) => error!(%run_id, error = %e, "Run aborted"),
            }
            let mut active = active.lock();
            if active.as_ref().is_some_and(|a| a.run_id == run_id) {
                *active = None;
            }
        });
        *slot = Some(ActiveRun {
            run_id,
            cancel,
            handle: Some(handle),
        });
        drop(slot);

        info!(%run_id, "Run launched");
        StartResponse {
            started: true,
            reason: None,
            run_id: Some(run_id),
        }
    }

    /// Runs the pipeline on the current task and returns its report.
    pub async fn run_to_completion(&self) -> Result<RunReport, SketchflowError> {
        let (ticket, digest) = self.claim_run()?;
        let run_id = ticket.run_id();
        let cancel = Arc::new(CancellationToken::new());
        *self.active.lock() = Some(ActiveRun {
            run_id,
            cancel: Arc::clone(&cancel),
            handle: None,
        });

        let result = self.orchestrator.run(ticket, cancel, Some(digest)).await;
        self.active.lock().take();

        let report = result?;
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Waits for the background run, if any, to finish.
    pub async fn wait_for_run(&self) {
        let handle = self.active.lock().as_mut().and_then(|a| a.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Run task panicked");
            }
        }
    }

    /// Requests cancellation of the active run.
    ///
    /// Returns false when no run is active.
    pub fn cancel_run(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(active) => active.cancel.cancel("cancel requested"),
            None => false,
        }
    }

    /// Current run status.
    #[must_use]
    pub fn get_status(&self) -> StatusResponse {
        let snapshot = self.tracker.snapshot();
        let (error, log_tail) = match &snapshot.state {
            RunState::Error { message, .. } => (
                Some(message.clone()),
                snapshot.log_path.as_deref().and_then(read_tail),
            ),
            _ => (None, None),
        };
        StatusResponse {
            description: describe_stage(&snapshot.state, &self.config.stages),
            stage: snapshot.stage,
            running: snapshot.running,
            quality: snapshot.quality,
            run_id: snapshot.run_id,
            log_path: snapshot.log_path,
            error,
            log_tail,
        }
    }

    /// The terminal artifact and latest log of a completed run.
    pub fn fetch_result(&self) -> Result<ResultBundle, SketchflowError> {
        let snapshot = self.tracker.snapshot();
        if !snapshot.state.is_completed() {
            return Err(SketchflowError::NotReady(format!(
                "run state is {}",
                snapshot.stage
            )));
        }

        let artifact = self.config.terminal_artifact();
        let size = std::fs::metadata(&artifact).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(SketchflowError::NotReady(format!(
                "{} is missing or empty",
                artifact.display()
            )));
        }

        let log = snapshot
            .log_path
            .filter(|p| p.exists())
            .or_else(|| latest_log(&self.config.log_dir()));
        Ok(ResultBundle { artifact, log })
    }

    /// Archives the namespace into the retention store, then purges it.
    pub fn request_cleanup(&self) -> Result<CleanupReport, SketchflowError> {
        let _claim = self.claim_maintenance("cleanup")?;
        let archive = self.retention.archive()?;
        let purge = self.retention.purge()?;
        Ok(CleanupReport { archive, purge })
    }

    /// Issues a single-use history wipe challenge.
    pub fn begin_history_wipe(&self) -> WipeChallenge {
        let now = Utc::now();
        let token = Uuid::new_v4();
        let expires_at = now + self.wipe_ttl;

        let mut challenges = self.challenges.lock();
        challenges.retain(|_, expiry| *expiry > now);
        challenges.insert(token, expires_at);

        WipeChallenge {
            token,
            phrase: WIPE_PHRASE.to_string(),
            expires_at,
        }
    }

    /// Empties the retention store after a valid confirmation.
    ///
    /// The token is consumed by every attempt, successful or not.
    pub fn confirm_history_wipe(
        &self,
        token: Uuid,
        phrase: &str,
    ) -> Result<PurgeReport, SketchflowError> {
        let expiry = self.challenges.lock().remove(&token).ok_or_else(|| {
            SketchflowError::Confirmation("unknown or already used token".to_string())
        })?;
        if Utc::now() > expiry {
            return Err(SketchflowError::Confirmation("challenge expired".to_string()));
        }
        if phrase != WIPE_PHRASE {
            warn!("History wipe phrase mismatch");
            return Err(SketchflowError::Confirmation(format!(
                "type '{WIPE_PHRASE}' exactly to confirm"
            )));
        }
        let _claim = self.claim_maintenance("history wipe")?;

        info!("Clearing retention history");
        self.retention.clear_retention()
    }

    /// Snapshot directories currently in the retention store.
    pub fn history_snapshots(&self) -> Result<Vec<PathBuf>, SketchflowError> {
        self.retention.snapshots()
    }

    fn input_digest(&self) -> Option<String> {
        let bytes = std::fs::read(self.gate.slot()).ok()?;
        if bytes.is_empty() {
            return None;
        }
        Some(hex::encode(Sha256::digest(&bytes)))
    }
}

fn respond(result: Result<AcceptedArtifact, SketchflowError>) -> AdmitResponse {
    match result {
        Ok(artifact) => AdmitResponse {
            accepted: true,
            reason: None,
            message: None,
            artifact: Some(artifact),
        },
        Err(err) => {
            if !matches!(
                err,
                SketchflowError::Validation(_) | SketchflowError::MaintenanceInProgress(_)
            ) {
                error!(error = %err, "Upload could not be stored");
            }
            AdmitResponse::rejected(&err)
        }
    }
}

fn read_tail(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let start = bytes.len().saturating_sub(LOG_TAIL_BYTES);
    Some(String::from_utf8_lossy(&bytes[start..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageDefinition;
    use crate::events::NoOpEventSink;
    use crate::pipeline::{StageExecution, StageExit, StageInvocation};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::time::Duration;

    /// Writes a terminal artifact from the last stage, optionally waiting
    /// for cancellation first.
    struct ScriptedRunner {
        terminal: &'static [u8],
        block: bool,
        delay: Duration,
    }

    #[async_trait]
    impl StageRunner for ScriptedRunner {
        async fn run(
            &self,
            invocation: StageInvocation,
            cancel: Arc<CancellationToken>,
        ) -> Result<StageExecution, SketchflowError> {
            tokio::time::sleep(self.delay).await;
            if self.block {
                cancel.cancelled().await;
                return Ok(StageExecution {
                    exit: StageExit::Cancelled,
                    output: String::new(),
                    duration_ms: 0,
                });
            }
            if invocation.stage_id == "render" {
                let dir = invocation.working_dir.join("shared_memory/7_PDFG_out");
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join("full_analysis_report.pdf"), self.terminal)?;
            }
            Ok(StageExecution {
                exit: StageExit::Code(0),
                output: format!("{} ok", invocation.stage_id),
                duration_ms: 1,
            })
        }
    }

    fn service(root: &Path, terminal: &'static [u8], block: bool) -> PipelineService {
        let stages = vec![
            StageDefinition::new("detect", ["true"], "2_OBJ_DET_out").with_reads(["0_BE_input"]),
            StageDefinition::new("render", ["true"], "7_PDFG_out").with_reads(["2_OBJ_DET_out"]),
        ];
        let runner = ScriptedRunner {
            terminal,
            block,
            delay: Duration::ZERO,
        };
        service_with(root, stages, runner)
    }

    fn service_with(
        root: &Path,
        stages: Vec<StageDefinition>,
        runner: ScriptedRunner,
    ) -> PipelineService {
        let config = PipelineConfig::default()
            .with_project_root(root)
            .with_stages(stages);
        PipelineService::with_runner(config, Arc::new(runner), Arc::new(NoOpEventSink)).unwrap()
    }

    fn seed_channel(service: &PipelineService, channel: &str, files: usize) {
        let dir = service.config().channel_dir(channel);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..files {
            std::fs::write(dir.join(format!("item_{i}.json")), format!("{{\"i\": {i}}}")).unwrap();
        }
    }

    fn logged_digest(service: &PipelineService) -> Option<String> {
        let log = latest_log(&service.config().log_dir())?;
        let text = std::fs::read_to_string(log).ok()?;
        text.lines()
            .find_map(|line| line.split("Input sha256: ").nth(1))
            .map(|digest| digest.trim().to_string())
    }

    fn drawing_png() -> Vec<u8> {
        striped_png(4)
    }

    fn striped_png(period: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(256, 256, |x, _| {
            if x % period == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_start_without_input_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF", false);
        let response = service.start_run();
        assert!(!response.started);
        assert_eq!(response.reason.as_deref(), Some("missing_input"));
        assert_eq!(service.get_status().stage, "not_started");
    }

    #[tokio::test]
    async fn test_upload_run_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF-1.4 report", false);

        assert!(service.admit_upload(&drawing_png()).accepted);
        let response = service.start_run();
        assert!(response.started);
        service.wait_for_run().await;

        let status = service.get_status();
        assert_eq!(status.stage, "completed");
        assert_eq!(status.description, "Analysis complete. Report is ready!");
        assert_eq!(status.quality, Some(ResultQuality::Ok));

        let bundle = service.fetch_result().unwrap();
        assert!(bundle.log.is_some());
        assert!(!bundle.to_zip().unwrap().is_empty());
        assert_eq!(service.last_report().unwrap().run_id, response.run_id.unwrap());
    }

    #[tokio::test]
    async fn test_empty_terminal_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"", false);
        service.admit_upload(&drawing_png());

        let report = service.run_to_completion().await.unwrap();
        assert!(report.is_completed());
        assert_eq!(service.get_status().stage, "completed");
        assert_eq!(service.fetch_result().unwrap_err().code(), "not_ready");
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF", true);
        service.admit_upload(&drawing_png());

        let first = service.start_run();
        assert!(first.started);
        let second = service.start_run();
        assert_eq!(second.reason.as_deref(), Some("already_running"));

        let upload = service.admit_upload(&drawing_png());
        assert_eq!(upload.reason.as_deref(), Some("run_in_progress"));
        assert_eq!(service.request_cleanup().unwrap_err().code(), "already_running");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.cancel_run());
        service.wait_for_run().await;

        let status = service.get_status();
        assert_eq!(status.stage, "error:detect");
        assert!(!status.running);
        assert!(status.log_tail.unwrap().contains("Error in detect"));
        assert!(!service.cancel_run());
    }

    #[tokio::test]
    async fn test_rejected_upload_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF", false);
        let response = service.admit_upload(b"GIF89a broken");
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some("invalid_format"));
        assert!(!service.config().input_slot().exists());
    }

    #[tokio::test]
    async fn test_cleanup_archives_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF-1.4", false);
        service.admit_upload(&drawing_png());
        service.run_to_completion().await.unwrap();

        let report = service.request_cleanup().unwrap();
        assert!(report.archive.skipped.is_empty());
        assert!(report
            .archive
            .snapshot
            .join("7_PDFG_out/full_analysis_report.pdf")
            .exists());
        assert!(!service.config().input_slot().exists());
        assert!(service.config().channel_dir("0_BE_input").is_dir());
    }

    #[test]
    fn test_history_wipe_requires_fresh_token_and_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF", false);
        std::fs::create_dir_all(service.config().retention_root().join("2024-01-01_00-00-00"))
            .unwrap();

        let challenge = service.begin_history_wipe();
        assert_eq!(challenge.phrase, WIPE_PHRASE);
        let err = service
            .confirm_history_wipe(challenge.token, "delete all history")
            .unwrap_err();
        assert_eq!(err.code(), "confirmation_failed");
        // token is single use
        assert!(service
            .confirm_history_wipe(challenge.token, WIPE_PHRASE)
            .is_err());

        let challenge = service.begin_history_wipe();
        let report = service
            .confirm_history_wipe(challenge.token, WIPE_PHRASE)
            .unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(service.config().retention_root().is_dir());
    }

    #[test]
    fn test_expired_challenge_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            service(dir.path(), b"%PDF", false).with_wipe_ttl(ChronoDuration::seconds(-1));
        let challenge = service.begin_history_wipe();
        let err = service
            .confirm_history_wipe(challenge.token, WIPE_PHRASE)
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_maintenance_claim_blocks_runs_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), b"%PDF", true);
        let original = drawing_png();
        service.admit_upload(&original);

        let guard = service.tracker().try_begin_maintenance("cleanup").unwrap();
        let refused = service.start_run();
        assert!(!refused.started);
        assert_eq!(refused.reason.as_deref(), Some("maintenance_in_progress"));

        let upload = service.admit_upload(&striped_png(3));
        assert_eq!(upload.reason.as_deref(), Some("maintenance_in_progress"));
        assert_eq!(std::fs::read(service.config().input_slot()).unwrap(), original);

        let challenge = service.begin_history_wipe();
        let err = service
            .confirm_history_wipe(challenge.token, WIPE_PHRASE)
            .unwrap_err();
        assert_eq!(err.code(), "maintenance_in_progress");
        drop(guard);

        assert!(service.start_run().started);
        assert!(service.cancel_run());
        service.wait_for_run().await;
        assert_eq!(service.tracker().maintenance(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cleanup_and_run_never_overlap() {
        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let service = Arc::new(service(dir.path(), b"%PDF", true));
            service.admit_upload(&drawing_png());
            seed_channel(&service, "2_OBJ_DET_out", 300);

            let cleaner = Arc::clone(&service);
            let cleanup = tokio::task::spawn_blocking(move || cleaner.request_cleanup());
            let started = service.start_run();
            let cleaned = cleanup.await.unwrap();

            assert_ne!(started.started, cleaned.is_ok(), "exactly one may win");
            if started.started {
                assert_eq!(cleaned.unwrap_err().code(), "already_running");
                assert!(service.config().input_slot().exists());
                service.cancel_run();
                service.wait_for_run().await;
            } else {
                let reason = started.reason.unwrap();
                assert!(
                    reason == "maintenance_in_progress" || reason == "missing_input",
                    "unexpected refusal {reason}"
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_digest_matches_slot_under_concurrent_upload() {
        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let service = Arc::new(service(dir.path(), b"%PDF", true));
            assert!(service.admit_upload(&drawing_png()).accepted);

            let uploader = Arc::clone(&service);
            let replacement = striped_png(3);
            let upload = tokio::task::spawn_blocking(move || uploader.admit_upload(&replacement));
            let started = service.start_run();
            let uploaded = upload.await.unwrap();
            assert!(started.started);
            if !uploaded.accepted {
                assert_eq!(uploaded.reason.as_deref(), Some("run_in_progress"));
            }

            let mut digest = None;
            for _ in 0..200 {
                digest = logged_digest(&service);
                if digest.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let slot = std::fs::read(service.config().input_slot()).unwrap();
            assert_eq!(digest, Some(hex::encode(Sha256::digest(&slot))));

            service.cancel_run();
            service.wait_for_run().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polled_stages_follow_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let order = ["detect", "classify", "measure", "render"];
        let stages = vec![
            StageDefinition::new("detect", ["true"], "2_OBJ_DET_out").with_reads(["0_BE_input"]),
            StageDefinition::new("classify", ["true"], "3_CLS_out").with_reads(["2_OBJ_DET_out"]),
            StageDefinition::new("measure", ["true"], "4_MEAS_out").with_reads(["3_CLS_out"]),
            StageDefinition::new("render", ["true"], "7_PDFG_out").with_reads(["4_MEAS_out"]),
        ];
        let runner = ScriptedRunner {
            terminal: b"%PDF",
            block: false,
            delay: Duration::from_millis(30),
        };
        let service = service_with(dir.path(), stages, runner);
        service.admit_upload(&drawing_png());
        assert!(service.start_run().started);

        let mut seen: Vec<String> = Vec::new();
        for _ in 0..1000 {
            let status = service.get_status();
            if seen.last() != Some(&status.stage) {
                seen.push(status.stage.clone());
            }
            if !status.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        service.wait_for_run().await;

        seen.retain(|stage| stage != "not_started");
        assert_eq!(seen.last().map(String::as_str), Some("completed"));
        assert_eq!(seen.iter().filter(|s| *s == "completed").count(), 1);

        let mut next = 0;
        for stage in &seen[..seen.len() - 1] {
            let position = order[next..]
                .iter()
                .position(|s| s == stage)
                .unwrap_or_else(|| panic!("{stage} out of order in {seen:?}"));
            next += position + 1;
        }
    }
}
