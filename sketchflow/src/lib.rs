//! # Sketchflow
//!
//! A runner for file-mediated analysis pipelines.
//!
//! Stages are external processes that communicate only through named
//! channel directories under a shared namespace. Sketchflow provides:
//!
//! - **Input gate**: decodes an uploaded image and rejects blank or
//!   undersized drawings before they reach the pipeline
//! - **Stage orchestration**: strictly ordered, fail-fast execution with a
//!   per-run log of every stage's output and exit code
//! - **Channel contracts**: optional JSON schemas checked when a stage's
//!   inputs are read
//! - **Run status**: a process-wide single-run tracker that pollers query
//! - **Retention**: timestamped snapshots of the namespace and purging
//!   between runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sketchflow::prelude::*;
//!
//! let config = PipelineConfig::from_file(Path::new("pipeline.yaml"))?;
//! let service = PipelineService::new(config)?;
//!
//! service.admit_path(Path::new("drawing.png"));
//! let report = service.run_to_completion().await?;
//! println!("{}", service.get_status().description);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bundle;
pub mod cancellation;
pub mod channel;
pub mod config;
pub mod errors;
pub mod events;
pub mod gate;
pub mod observability;
pub mod pipeline;
pub mod retention;
pub mod service;
pub mod status;
pub mod utils;

#[cfg(feature = "server")]
pub mod server;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bundle::ResultBundle;
    pub use crate::cancellation::CancellationToken;
    pub use crate::channel::{
        ArtifactPayload, Channel, ChannelContract, ChannelNamespace, ChannelReader,
        SchemaRegistry, ViolationPolicy,
    };
    pub use crate::config::{PipelineConfig, StageDefinition};
    pub use crate::errors::{FailureKind, RejectionReason, SketchflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gate::{AcceptedArtifact, InputGate};
    pub use crate::pipeline::{Orchestrator, ProcessStageRunner, RunReport, StageRunner};
    pub use crate::retention::RetentionManager;
    pub use crate::service::PipelineService;
    pub use crate::status::{ResultQuality, RunState, RunStatusTracker};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
