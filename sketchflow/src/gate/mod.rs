//! Input validation gate.
//!
//! Admits or rejects an uploaded image before it may seed a run. Checks run
//! cheapest first and stop at the first failure:
//!
//! 1. decodability
//! 2. content presence (share of non-blank pixels)
//! 3. resolution floor
//!
//! An admitted image is copied into the canonical input slot. A rejected
//! one never touches the slot.

use crate::config::GateConfig;
use crate::errors::{RejectionReason, SketchflowError};
use image::RgbImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An image that passed every check and now occupies the input slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedArtifact {
    /// Path of the input slot.
    pub path: PathBuf,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Percentage of pixels below the blank threshold.
    pub non_blank_percent: f64,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Result of inspecting image bytes without storing them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inspection {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Percentage of pixels below the blank threshold.
    pub non_blank_percent: f64,
}

/// Percentage of pixels that are not blank.
///
/// A pixel is blank when all three channels are at or above `threshold`.
/// An image without pixels has no content.
#[must_use]
pub fn non_blank_percent(image: &RgbImage, threshold: u8) -> f64 {
    let total = u64::from(image.width()) * u64::from(image.height());
    if total == 0 {
        return 0.0;
    }
    let non_blank = image
        .pixels()
        .filter(|p| p.0.iter().any(|&c| c < threshold))
        .count() as u64;
    #[allow(clippy::cast_precision_loss)]
    let percent = non_blank as f64 / total as f64 * 100.0;
    percent
}

/// The input validation gate.
#[derive(Debug, Clone)]
pub struct InputGate {
    config: GateConfig,
    slot: PathBuf,
}

impl InputGate {
    /// Creates a gate that stores admitted images at `slot`.
    #[must_use]
    pub fn new(config: GateConfig, slot: impl Into<PathBuf>) -> Self {
        Self {
            config,
            slot: slot.into(),
        }
    }

    /// The canonical input slot.
    #[must_use]
    pub fn slot(&self) -> &Path {
        &self.slot
    }

    /// The gate thresholds.
    #[must_use]
    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Runs the three checks on raw bytes.
    pub fn inspect(&self, bytes: &[u8]) -> Result<Inspection, RejectionReason> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| RejectionReason::InvalidFormat {
                detail: e.to_string(),
            })?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();

        let non_blank_percent = non_blank_percent(&rgb, self.config.white_threshold);
        if non_blank_percent < self.config.min_non_blank_percent {
            return Err(RejectionReason::EmptyContent { non_blank_percent });
        }

        if width < self.config.min_width || height < self.config.min_height {
            return Err(RejectionReason::TooSmall {
                width,
                height,
                min_width: self.config.min_width,
                min_height: self.config.min_height,
            });
        }

        Ok(Inspection {
            width,
            height,
            non_blank_percent,
        })
    }

    /// Admits the image at `path`, copying it into the input slot.
    pub fn admit(&self, path: &Path) -> Result<AcceptedArtifact, SketchflowError> {
        let bytes = Self::load(path)?;
        self.admit_bytes(&bytes)
    }

    /// Admits an uploaded image held in memory.
    pub fn admit_bytes(&self, bytes: &[u8]) -> Result<AcceptedArtifact, SketchflowError> {
        let inspection = self.check(bytes)?;
        self.commit(bytes, inspection)
    }

    /// Reads a candidate image, rejecting a missing file as `not_found`.
    pub fn load(path: &Path) -> Result<Vec<u8>, SketchflowError> {
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RejectionReason::NotFound {
                path: path.to_path_buf(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// [`inspect`](Self::inspect) with the rejection logged and lifted into
    /// [`SketchflowError`].
    pub fn check(&self, bytes: &[u8]) -> Result<Inspection, SketchflowError> {
        self.inspect(bytes).map_err(|reason| {
            info!(reason = reason.code(), "Upload rejected");
            reason.into()
        })
    }

    /// Stores already inspected bytes in the input slot.
    ///
    /// Callers that must serialise slot writes against runs inspect first,
    /// then commit under their own lock.
    pub fn commit(
        &self,
        bytes: &[u8],
        inspection: Inspection,
    ) -> Result<AcceptedArtifact, SketchflowError> {
        self.store(bytes)?;
        let sha256 = hex::encode(Sha256::digest(bytes));
        info!(
            path = %self.slot.display(),
            width = inspection.width,
            height = inspection.height,
            sha256 = %sha256,
            "Upload admitted"
        );

        Ok(AcceptedArtifact {
            path: self.slot.clone(),
            width: inspection.width,
            height: inspection.height,
            non_blank_percent: inspection.non_blank_percent,
            sha256,
        })
    }

    /// Writes through a sibling temp file so the slot is never half-written.
    fn store(&self, bytes: &[u8]) -> Result<(), SketchflowError> {
        let parent = self
            .slot
            .parent()
            .ok_or_else(|| SketchflowError::Internal("input slot has no parent".to_string()))?;
        fs::create_dir_all(parent)?;

        let file_name = self
            .slot
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.tmp"));
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &self.slot) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %self.slot.display(), bytes = bytes.len(), "Input slot replaced");
        Ok(())
    }
}
