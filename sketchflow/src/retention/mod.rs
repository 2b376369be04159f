//! Archival and retention of channel contents.
//!
//! Between runs the namespace is copied into a timestamped snapshot under
//! the retention directory and then purged. Every item is handled on its
//! own: one file that cannot be copied or removed is skipped and reported,
//! the rest of the operation carries on.

use crate::config::PipelineConfig;
use crate::errors::{RetentionIoError, SketchflowError};
use crate::utils::{has_excluded_extension, run_stamp};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of [`RetentionManager::archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    /// The snapshot directory that was created.
    pub snapshot: PathBuf,
    /// Files copied, relative to the namespace.
    pub copied: Vec<PathBuf>,
    /// Items that could not be copied.
    pub skipped: Vec<RetentionIoError>,
}

/// Result of [`RetentionManager::purge`] and
/// [`RetentionManager::clear_retention`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Entries removed.
    pub removed: Vec<PathBuf>,
    /// Entries that could not be removed.
    pub skipped: Vec<RetentionIoError>,
}

/// Snapshots and purges the channel namespace.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    namespace: PathBuf,
    retention_name: String,
    excluded_extensions: Vec<String>,
}

impl RetentionManager {
    /// Creates a manager for `namespace` with the retention directory
    /// `retention_name` inside it.
    #[must_use]
    pub fn new(
        namespace: impl Into<PathBuf>,
        retention_name: impl Into<String>,
        excluded_extensions: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            retention_name: retention_name.into(),
            excluded_extensions,
        }
    }

    /// Creates a manager from pipeline configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.namespace_root(),
            config.retention_dir.clone(),
            config.excluded_extensions.clone(),
        )
    }

    /// The retention directory.
    #[must_use]
    pub fn retention_root(&self) -> PathBuf {
        self.namespace.join(&self.retention_name)
    }

    /// Existing snapshot directories, oldest first.
    pub fn snapshots(&self) -> Result<Vec<PathBuf>, SketchflowError> {
        let mut snapshots: Vec<PathBuf> = match fs::read_dir(self.retention_root()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .map(|e| e.path())
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        snapshots.sort();
        Ok(snapshots)
    }

    /// Copies the namespace into a new timestamped snapshot.
    pub fn archive(&self) -> Result<ArchiveReport, SketchflowError> {
        let retention = self.retention_root();
        fs::create_dir_all(&retention)?;
        let snapshot = create_unique_dir(&retention, &run_stamp())?;

        let mut report = ArchiveReport {
            snapshot: snapshot.clone(),
            copied: Vec::new(),
            skipped: Vec::new(),
        };

        for entry in self.top_level_entries()? {
            let Some(name) = entry.file_name() else { continue };
            let target = snapshot.join(name);
            self.copy_entry(&entry, &target, Path::new(name), &mut report);
        }

        info!(
            snapshot = %snapshot.display(),
            copied = report.copied.len(),
            skipped = report.skipped.len(),
            "Archive snapshot created"
        );
        Ok(report)
    }

    /// Deletes channel contents, keeping the channel directories themselves,
    /// the retention directory and excluded files.
    pub fn purge(&self) -> Result<PurgeReport, SketchflowError> {
        let mut report = PurgeReport::default();

        for entry in self.top_level_entries()? {
            if is_real_dir(&entry) {
                let children = match sorted_children(&entry) {
                    Ok(children) => children,
                    Err(e) => {
                        skip(&mut report.skipped, &entry, &e);
                        continue;
                    }
                };
                for child in children {
                    if !is_real_dir(&child)
                        && has_excluded_extension(&child, &self.excluded_extensions)
                    {
                        continue;
                    }
                    remove_entry(&child, &mut report);
                }
            } else {
                remove_entry(&entry, &mut report);
            }
        }

        info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "Namespace purged"
        );
        Ok(report)
    }

    /// Empties the retention directory, keeping the directory itself.
    pub fn clear_retention(&self) -> Result<PurgeReport, SketchflowError> {
        let mut report = PurgeReport::default();
        let retention = self.retention_root();
        let entries = match sorted_children(&retention) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %retention.display(), "Retention directory does not exist");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            remove_entry(&entry, &mut report);
        }
        info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "Retention directory cleared"
        );
        Ok(report)
    }

    /// Top-level namespace entries other than the retention directory and
    /// excluded files.
    fn top_level_entries(&self) -> Result<Vec<PathBuf>, SketchflowError> {
        let entries = match sorted_children(&self.namespace) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy() != self.retention_name)
            })
            .filter(|p| {
                is_real_dir(p) || !has_excluded_extension(p, &self.excluded_extensions)
            })
            .collect())
    }

    fn copy_entry(
        &self,
        source: &Path,
        target: &Path,
        relative: &Path,
        report: &mut ArchiveReport,
    ) {
        if is_real_dir(source) {
            if let Err(e) = fs::create_dir_all(target) {
                skip(&mut report.skipped, source, &e);
                return;
            }
            let children = match sorted_children(source) {
                Ok(children) => children,
                Err(e) => {
                    skip(&mut report.skipped, source, &e);
                    return;
                }
            };
            for child in children {
                let Some(name) = child.file_name() else { continue };
                if !is_real_dir(&child) && has_excluded_extension(&child, &self.excluded_extensions)
                {
                    continue;
                }
                self.copy_entry(&child, &target.join(name), &relative.join(name), report);
            }
        } else {
            match fs::copy(source, target) {
                Ok(_) => {
                    debug!(path = %relative.display(), "Archived");
                    report.copied.push(relative.to_path_buf());
                }
                Err(e) => skip(&mut report.skipped, source, &e),
            }
        }
    }
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

fn sorted_children(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    children.sort();
    Ok(children)
}

fn create_unique_dir(parent: &Path, stamp: &str) -> io::Result<PathBuf> {
    let mut candidate = parent.join(stamp);
    let mut suffix = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = parent.join(format!("{stamp}_{suffix}"));
                suffix += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn skip(skipped: &mut Vec<RetentionIoError>, path: &Path, error: &io::Error) {
    warn!(path = %path.display(), error = %error, "Skipping item");
    skipped.push(RetentionIoError::new(path, error.to_string()));
}

fn remove_entry(path: &Path, report: &mut PurgeReport) {
    let dir = is_real_dir(path);
    let remove = || {
        if dir {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    };
    let result = match remove() {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_writable(path);
            remove()
        }
        other => other,
    };
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "Removed");
            report.removed.push(path.to_path_buf());
        }
        Err(e) => skip(&mut report.skipped, path, &e),
    }
}

#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(path: &Path) {
    if let Ok(meta) = fs::symlink_metadata(path) {
        let mut perms = meta.permissions();
        perms.set_readonly(false);
        let _ = fs::set_permissions(path, perms);
    }
}
