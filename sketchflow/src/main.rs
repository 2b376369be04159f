//! Sketchflow CLI
//!
//! Runs the drawing analysis pipeline once or serves it over HTTP.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use sketchflow::observability::{init_tracing, LogFormat};
use sketchflow::prelude::*;
use sketchflow::retention::PurgeReport;

#[derive(Parser)]
#[command(name = "sketchflow", version)]
#[command(about = "Run a file-mediated drawing analysis pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.yaml", global = true)]
    config: PathBuf,

    /// Process log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the upload, status and download endpoints
    #[cfg(feature = "server")]
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        bind: std::net::SocketAddr,
    },

    /// Analyze one image end to end
    Run {
        /// The drawing to analyze
        image: PathBuf,

        /// Where to write the result bundle
        #[arg(short, long, default_value = "analysis_bundle.zip")]
        output: PathBuf,

        /// Skip the archive and purge after the run
        #[arg(long)]
        keep: bool,
    },

    /// Archive the namespace into the history directory, then purge it
    Cleanup,

    /// Delete every archived snapshot after an interactive confirmation
    WipeHistory,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, Level::INFO)?;

    match cli.command {
        #[cfg(feature = "server")]
        Commands::Serve { bind } => {
            let service = load_service(&cli.config)?;
            sketchflow::server::serve(Arc::new(service), bind).await?;
        }

        Commands::Run {
            image,
            output,
            keep,
        } => run_command(&cli.config, &image, &output, keep).await?,

        Commands::Cleanup => {
            let report = load_service(&cli.config)?.request_cleanup()?;
            info!(
                snapshot = %report.archive.snapshot.display(),
                archived = report.archive.copied.len(),
                purged = report.purge.removed.len(),
                skipped = report.archive.skipped.len() + report.purge.skipped.len(),
                "Cleanup finished"
            );
        }

        Commands::WipeHistory => {
            let service = load_service(&cli.config)?;
            let mut stdin = std::io::stdin().lock();
            let report = wipe_history(&service, &mut stdin, &mut std::io::stdout())?;
            if let Some(report) = report {
                info!(removed = report.removed.len(), "History cleared");
            }
        }

        Commands::Validate => {
            let config = PipelineConfig::from_file(&cli.config)?;
            config.validate()?;
            println!(
                "Configuration is valid: {} stages, terminal artifact {}",
                config.stages.len(),
                config.terminal_artifact().display()
            );
        }

        Commands::GenerateConfig { output } => {
            let yaml = PipelineConfig::example().to_yaml()?;
            std::fs::write(&output, yaml)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Generated sample configuration at {}", output.display());
        }
    }

    Ok(())
}

fn load_service(config_path: &Path) -> Result<PipelineService> {
    let config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    Ok(PipelineService::new(config)?)
}

async fn run_command(config_path: &Path, image: &Path, output: &Path, keep: bool) -> Result<()> {
    let service = load_service(config_path)?;

    let admitted = service.admit_path(image);
    if !admitted.accepted {
        bail!(
            "{} rejected: {}",
            image.display(),
            admitted.message.unwrap_or_default()
        );
    }

    let report = service.run_to_completion().await?;
    let status = service.get_status();

    let outcome = if report.is_completed() {
        match service.fetch_result() {
            Ok(bundle) => {
                bundle.write_zip(output)?;
                info!(bundle = %output.display(), "Result bundle written");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    } else if let Some(failure) = report.failure() {
        if failure.is_timeout() {
            warn!(stage = %failure.stage, "Stage hit its timeout_secs limit");
        }
        Err(anyhow::Error::new(SketchflowError::StageExecution(failure))
            .context(format!("see {}", report.log_path.display())))
    } else {
        Err(anyhow::anyhow!(
            "{} (log: {})",
            status.description,
            report.log_path.display()
        ))
    };

    if keep {
        info!("Keeping namespace contents");
    } else {
        match service.request_cleanup() {
            Ok(cleanup) => info!(snapshot = %cleanup.archive.snapshot.display(), "Run archived"),
            Err(e) => warn!(error = %e, "Cleanup after run failed"),
        }
    }

    if status.quality == Some(ResultQuality::Degraded) {
        warn!("The report was produced with a degraded result");
    }
    outcome
}

/// Shows what a history wipe would delete, then asks for the phrase.
///
/// Returns `None` when there is nothing to delete.
fn wipe_history(
    service: &PipelineService,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<Option<PurgeReport>> {
    let snapshots = service.history_snapshots()?;
    if snapshots.is_empty() {
        writeln!(out, "No archived runs to delete.")?;
        return Ok(None);
    }

    let challenge = service.begin_history_wipe();
    writeln!(
        out,
        "This permanently deletes {} archived run(s) under {}.",
        snapshots.len(),
        service.config().retention_root().display()
    )?;
    write!(out, "Type '{}' to confirm: ", challenge.phrase)?;
    out.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim_end_matches(['\r', '\n']);
    Ok(Some(service.confirm_history_wipe(challenge.token, answer)?))
}
