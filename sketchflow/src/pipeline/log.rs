//! The per-run plaintext log.
//!
//! Opened once per run and flushed after every section, so a poller can
//! read a partial log while the run is still going.

use crate::errors::SketchflowError;
use crate::status::TerminalCheck;
use crate::utils::run_stamp;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const BANNER: &str = "==================================================";

/// File name prefix shared by every run log.
pub const LOG_PREFIX: &str = "flow_log_";

/// Writer for one run's log file.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Creates `flow_log_<stamp>.txt` in `dir` and writes the run header.
    pub async fn create(
        dir: &Path,
        run_id: Uuid,
        input_digest: Option<&str>,
    ) -> Result<Self, SketchflowError> {
        fs::create_dir_all(dir).await?;
        let stamp = run_stamp();

        let mut path = dir.join(format!("{LOG_PREFIX}{stamp}.txt"));
        let mut suffix = 1;
        while fs::try_exists(&path).await? {
            path = dir.join(format!("{LOG_PREFIX}{stamp}_{suffix}.txt"));
            suffix += 1;
        }

        let file = File::create(&path).await?;
        let mut log = Self { path, file };

        let mut header = format!(
            "{BANNER}\n🚀 Full Analysis Flow Log\n🕒 Started at: {stamp}\n🆔 Run: {run_id}\n"
        );
        if let Some(digest) = input_digest {
            header.push_str(&format!("🖼  Input sha256: {digest}\n"));
        }
        header.push_str(BANNER);
        header.push('\n');
        log.write(&header).await?;
        Ok(log)
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a stage section.
    pub async fn stage_header(
        &mut self,
        stage: &str,
        command: &str,
    ) -> Result<(), SketchflowError> {
        let header = format!("▶ Running: {stage} ({command})");
        let divider = "=".repeat(header.chars().count());
        self.write(&format!("\n{divider}\n{header}\n{divider}\n"))
            .await
    }

    /// Records a tolerated problem inside the current section.
    pub async fn note(&mut self, line: &str) -> Result<(), SketchflowError> {
        self.write(&format!("⚠️  {line}\n")).await
    }

    /// Writes the captured output and the exit code line.
    pub async fn stage_output(
        &mut self,
        output: &str,
        exit_code: &str,
    ) -> Result<(), SketchflowError> {
        let mut text = if output.is_empty() {
            "[NO OUTPUT RECEIVED]\n".to_string()
        } else {
            output.to_string()
        };
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[EXIT CODE] {exit_code}\n"));
        self.write(&text).await
    }

    /// Closes a section for a successful stage.
    pub async fn stage_finished(&mut self, stage: &str) -> Result<(), SketchflowError> {
        self.write(&format!("✅ Finished: {stage}\n\n")).await
    }

    /// Closes a section for a failed stage.
    pub async fn stage_failed(
        &mut self,
        stage: &str,
        detail: &str,
    ) -> Result<(), SketchflowError> {
        self.write(&format!("❌ Error in {stage}: {detail}\n")).await
    }

    /// Writes the terminal artifact verdict footer.
    pub async fn terminal_verdict(
        &mut self,
        check: TerminalCheck,
        artifact: &Path,
    ) -> Result<(), SketchflowError> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let line = match check {
            TerminalCheck::Ok => format!("✅ {name} generated successfully."),
            TerminalCheck::Sentinel => {
                format!("⚠️  {name} is a fallback document (generation failed marker found).")
            }
            TerminalCheck::Missing | TerminalCheck::Empty => {
                format!("❌ No {name} found or file is empty.")
            }
        };
        self.write(&format!("\n{BANNER}\n{line}\n{BANNER}\n")).await
    }

    async fn write(&mut self, text: &str) -> Result<(), SketchflowError> {
        self.file.write_all(text.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// Newest `flow_log_*.txt` in `dir` by modification time.
pub fn latest_log(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".txt")
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}
