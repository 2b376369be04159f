//! End-to-end runs with real shell-script stages.

use super::*;
use crate::cancellation::CancellationToken;
use crate::config::{PipelineConfig, StageDefinition};
use crate::errors::FailureKind;
use crate::status::{ResultQuality, RunState, RunStatusTracker};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

/// A stage that records its invocation, writes `<channel>/out.json` and
/// exits with `code`.
fn script_stage(id: &str, reads: &str, writes: &str, code: i32) -> StageDefinition {
    let script = format!(
        "echo {id} >> invocations.txt; \
         mkdir -p shared_memory/{writes}; \
         echo '{{\"stage\": \"{id}\"}}' > shared_memory/{writes}/out.json; \
         echo \"{id} done\"; exit {code}"
    );
    StageDefinition::new(id, ["sh", "-c", script.as_str()], writes).with_reads([reads])
}

fn pdf_stage(reads: &str, body: &str) -> StageDefinition {
    let script = format!(
        "echo run_PDFG >> invocations.txt; \
         mkdir -p shared_memory/7_PDFG_out; \
         printf '%s' '{body}' > shared_memory/7_PDFG_out/full_analysis_report.pdf"
    );
    StageDefinition::new("run_PDFG", ["sh", "-c", script.as_str()], "7_PDFG_out")
        .with_reads([reads])
}

fn invocations(root: &Path) -> Vec<String> {
    std::fs::read_to_string(root.join("invocations.txt"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

async fn execute(config: PipelineConfig) -> (RunReport, Arc<RunStatusTracker>) {
    let tracker = Arc::new(RunStatusTracker::new());
    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(ProcessStageRunner::new()));
    let ticket = tracker.try_begin().unwrap();
    let report = orchestrator
        .run(ticket, Arc::new(CancellationToken::new()), Some("feedface".into()))
        .await
        .unwrap();
    (report, tracker)
}

#[tokio::test]
async fn test_full_run_produces_report_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default()
        .with_project_root(dir.path())
        .with_stages(vec![
            script_stage("run_OBJ_DET", "0_BE_input", "2_OBJ_DET_out", 0),
            script_stage("run_FED", "2_OBJ_DET_out", "3_FED_out", 0),
            pdf_stage("3_FED_out", "%PDF-1.4 report"),
        ]);

    let (report, tracker) = execute(config).await;

    assert_eq!(tracker.get_stage(), "completed");
    assert_eq!(report.quality, Some(ResultQuality::Ok));
    assert_eq!(
        invocations(dir.path()),
        vec!["run_OBJ_DET", "run_FED", "run_PDFG"]
    );
    assert!(dir.path().join("shared_memory/3_FED_out/out.json").exists());

    let log = std::fs::read_to_string(&report.log_path).unwrap();
    assert!(report.log_path.starts_with(dir.path().join("shared_memory/0_BE_out")));
    assert!(log.contains("Input sha256: feedface"));
    assert!(log.contains("run_FED done\n[EXIT CODE] 0\n✅ Finished: run_FED"));
    assert!(log.contains("[NO OUTPUT RECEIVED]"));
}

#[tokio::test]
async fn test_third_of_eight_stages_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut stages = Vec::new();
    let mut previous = "0_BE_input".to_string();
    for i in 1..=7 {
        let channel = format!("{i}_out");
        let code = if i == 3 { 1 } else { 0 };
        stages.push(script_stage(&format!("stage-{i}"), &previous, &channel, code));
        previous = channel;
    }
    stages.push(pdf_stage(&previous, "%PDF"));
    let config = PipelineConfig::default()
        .with_project_root(dir.path())
        .with_stages(stages);

    let (report, tracker) = execute(config).await;

    assert_eq!(tracker.get_stage(), "error:stage-3");
    assert_eq!(invocations(dir.path()), vec!["stage-1", "stage-2", "stage-3"]);

    let log = std::fs::read_to_string(&report.log_path).unwrap();
    assert!(log.contains("▶ Running: stage-3"));
    assert!(!log.contains("▶ Running: stage-4"));
    assert!(!log.contains("run_PDFG"));
}

#[tokio::test]
async fn test_zero_byte_terminal_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default()
        .with_project_root(dir.path())
        .with_stages(vec![pdf_stage("0_BE_input", "")]);

    let (report, tracker) = execute(config).await;
    assert_eq!(tracker.get_stage(), "completed");
    assert_eq!(report.quality, Some(ResultQuality::Degraded));
}

#[tokio::test]
async fn test_hung_stage_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default()
        .with_project_root(dir.path())
        .with_stages(vec![
            StageDefinition::new("run_AG", ["sh", "-c", "exec sleep 30"], "6_AG_out")
                .with_timeout_secs(1),
            pdf_stage("6_AG_out", "%PDF"),
        ]);

    let started = std::time::Instant::now();
    let (report, tracker) = execute(config).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(15));
    assert_eq!(tracker.get_stage(), "error:run_AG");
    match report.state {
        RunState::Error { kind, .. } => assert_eq!(kind, FailureKind::Timeout(1)),
        other => panic!("unexpected state {other}"),
    }
    assert!(invocations(dir.path()).is_empty());
}
