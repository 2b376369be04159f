//! Directory-backed data channels between stages.
//!
//! A channel is a directory inside the shared namespace. Exactly one stage
//! produces it per run and every write replaces the previous contents.
//! Reads of a channel that was never populated return nothing rather than
//! failing, so optional upstream data degrades gracefully.

mod schema;

pub use schema::{validate, ChannelContract, SchemaRegistry, ViolationPolicy, ANY_ARTIFACT};

use crate::errors::{SchemaViolation, SketchflowError};
use crate::utils::is_contained_relative;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The shared channel namespace.
#[derive(Debug, Clone)]
pub struct ChannelNamespace {
    root: PathBuf,
}

impl ChannelNamespace {
    /// Creates a namespace rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The namespace directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Addresses a channel by name.
    #[must_use]
    pub fn channel(&self, name: &str) -> Channel {
        Channel {
            name: name.to_string(),
            dir: self.root.join(name),
        }
    }
}

/// A file to be written into a channel.
#[derive(Debug, Clone)]
pub struct ArtifactPayload {
    /// Path relative to the channel directory.
    pub relative_path: PathBuf,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl ArtifactPayload {
    /// Creates a payload from raw bytes.
    #[must_use]
    pub fn new(relative_path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes: bytes.into(),
        }
    }

    /// Creates a pretty-printed JSON payload.
    pub fn json(
        relative_path: impl Into<PathBuf>,
        value: &serde_json::Value,
    ) -> Result<Self, SketchflowError> {
        Ok(Self::new(relative_path, serde_json::to_vec_pretty(value)?))
    }
}

/// A file currently present in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelArtifact {
    /// Path relative to the channel directory, `/`-separated.
    pub relative_path: String,
    /// Full path on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl ChannelArtifact {
    /// Returns true for `.json` artifacts.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.relative_path.ends_with(".json")
    }
}

/// A named channel directory.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    dir: PathBuf,
}

impl Channel {
    /// The channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replaces the entire contents of the channel with `artifacts`.
    ///
    /// All names are checked before anything is deleted.
    pub fn write(&self, artifacts: &[ArtifactPayload]) -> Result<Vec<PathBuf>, SketchflowError> {
        if let Some(bad) = artifacts
            .iter()
            .find(|a| !is_contained_relative(&a.relative_path))
        {
            return Err(SketchflowError::InvalidArtifact(format!(
                "{} escapes channel '{}'",
                bad.relative_path.display(),
                self.name
            )));
        }

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir)?;

        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let path = self.dir.join(&artifact.relative_path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &artifact.bytes)?;
            written.push(path);
        }

        debug!(channel = %self.name, count = written.len(), "Channel written");
        Ok(written)
    }

    /// Lists the files currently in the channel, sorted by relative path.
    ///
    /// A channel that was never populated yields an empty list.
    pub fn read(&self) -> Result<Vec<ChannelArtifact>, SketchflowError> {
        let mut files = Vec::new();
        match collect_files(&self.dir, &mut files) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut artifacts: Vec<ChannelArtifact> = files
            .into_iter()
            .filter_map(|path| {
                let relative = path.strip_prefix(&self.dir).ok()?;
                let relative_path = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Some(ChannelArtifact {
                    relative_path,
                    path,
                    size,
                })
            })
            .collect();
        artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(artifacts)
    }

    /// Returns true if the channel holds at least one file.
    pub fn is_populated(&self) -> Result<bool, SketchflowError> {
        Ok(!self.read()?.is_empty())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// A JSON artifact loaded through its contract.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedArtifact {
    /// Parsed document.
    pub value: serde_json::Value,
    /// Violations tolerated under the channel policy.
    pub violations: Vec<String>,
}

impl LoadedArtifact {
    /// Returns true if the document matched its schema.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Result of checking every contracted artifact of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelCheck {
    /// Number of artifacts that had a schema.
    pub checked: usize,
    /// Violations tolerated under the channel policy.
    pub tolerated: Vec<SchemaViolation>,
}

/// Consumer-side access to channels with schema enforcement.
#[derive(Debug, Clone)]
pub struct ChannelReader {
    namespace: ChannelNamespace,
    registry: Arc<SchemaRegistry>,
}

impl ChannelReader {
    /// Creates a reader over a namespace and registry.
    #[must_use]
    pub fn new(namespace: ChannelNamespace, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            namespace,
            registry,
        }
    }

    /// The schema registry used by this reader.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Loads one JSON artifact, validating it when a schema is registered.
    ///
    /// Returns `Ok(None)` when the artifact does not exist. Under the
    /// `abort` policy a violation is returned as an error; under
    /// `tolerate` it is logged and attached to the result.
    pub fn load_json(
        &self,
        channel: &str,
        artifact: &str,
    ) -> Result<Option<LoadedArtifact>, SketchflowError> {
        if !is_contained_relative(Path::new(artifact)) {
            return Err(SketchflowError::InvalidArtifact(artifact.to_string()));
        }
        let path = self.namespace.channel(channel).dir().join(artifact);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(channel, artifact, "Missing channel artifact");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (value, violations) = self.check_bytes(channel, artifact, &bytes);
        if !violations.is_empty() {
            self.handle_violation(SchemaViolation::new(channel, artifact, violations.clone()))?;
        }
        Ok(Some(LoadedArtifact { value, violations }))
    }

    /// Validates every artifact of `channel` that has a schema.
    ///
    /// Under `abort` the first violating artifact is returned as an error.
    pub fn check_channel(&self, channel: &str) -> Result<ChannelCheck, SketchflowError> {
        let Some(contract) = self.registry.contract(channel) else {
            return Ok(ChannelCheck::default());
        };

        let mut check = ChannelCheck::default();
        for artifact in self.namespace.channel(channel).read()? {
            if contract.schema_for(&artifact.relative_path).is_none() {
                continue;
            }
            check.checked += 1;
            let bytes = fs::read(&artifact.path)?;
            let (_, violations) = self.check_bytes(channel, &artifact.relative_path, &bytes);
            if !violations.is_empty() {
                let violation =
                    SchemaViolation::new(channel, artifact.relative_path.clone(), violations);
                self.handle_violation(violation.clone())?;
                check.tolerated.push(violation);
            }
        }
        Ok(check)
    }

    fn check_bytes(
        &self,
        channel: &str,
        artifact: &str,
        bytes: &[u8],
    ) -> (serde_json::Value, Vec<String>) {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => return (serde_json::Value::Null, vec![format!("$: invalid JSON: {e}")]),
        };
        let violations = self
            .registry
            .contract(channel)
            .and_then(|c| c.schema_for(artifact).map(|schema| validate(&value, schema)))
            .unwrap_or_default();
        (value, violations)
    }

    fn handle_violation(&self, violation: SchemaViolation) -> Result<(), SketchflowError> {
        match self.registry.policy(&violation.channel) {
            ViolationPolicy::Abort => Err(violation.into()),
            ViolationPolicy::Tolerate => {
                warn!(
                    channel = %violation.channel,
                    artifact = %violation.artifact,
                    violations = ?violation.violations,
                    "Tolerating schema violation"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, ChannelNamespace) {
        let dir = tempfile::tempdir().unwrap();
        let ns = ChannelNamespace::new(dir.path().join("shared_memory"));
        (dir, ns)
    }

    #[test]
    fn test_read_unpopulated_channel_is_empty() {
        let (_dir, ns) = setup();
        let channel = ns.channel("3_FED_out");
        assert!(channel.read().unwrap().is_empty());
        assert!(!channel.is_populated().unwrap());
    }

    #[test]
    fn test_write_replaces_previous_contents() {
        let (_dir, ns) = setup();
        let channel = ns.channel("2_OBJ_DET_out");

        channel
            .write(&[
                ArtifactPayload::new("crops/obj_1.png", vec![1, 2, 3]),
                ArtifactPayload::new("stale.json", b"{}".to_vec()),
            ])
            .unwrap();
        channel
            .write(&[ArtifactPayload::new("jsons/obj_1.json", b"{\"id\": 1}".to_vec())])
            .unwrap();

        let names: Vec<_> = channel
            .read()
            .unwrap()
            .into_iter()
            .map(|a| a.relative_path)
            .collect();
        assert_eq!(names, vec!["jsons/obj_1.json".to_string()]);
    }

    #[test]
    fn test_write_rejects_escaping_names_without_touching_contents() {
        let (_dir, ns) = setup();
        let channel = ns.channel("1_EC_out");
        channel.write(&[ArtifactPayload::new("keep.json", b"{}".to_vec())]).unwrap();

        let err = channel
            .write(&[ArtifactPayload::new("../evil.json", b"{}".to_vec())])
            .unwrap_err();
        assert!(matches!(err, SketchflowError::InvalidArtifact(_)));
        assert_eq!(channel.read().unwrap().len(), 1);
    }

    #[test]
    fn test_load_json_tolerate_returns_violations() {
        let (_dir, ns) = setup();
        let registry = Arc::new(SchemaRegistry::new());
        registry.register(
            "1_EC_out",
            ChannelContract::new(ViolationPolicy::Tolerate).with_schema(
                "EC_result.json",
                json!({"type": "object", "required": ["emotion"]}),
            ),
        );
        ns.channel("1_EC_out")
            .write(&[ArtifactPayload::json("EC_result.json", &json!({"score": 1})).unwrap()])
            .unwrap();

        let reader = ChannelReader::new(ns, registry);
        let loaded = reader.load_json("1_EC_out", "EC_result.json").unwrap().unwrap();
        assert!(!loaded.is_valid());
        assert_eq!(loaded.value, json!({"score": 1}));
    }

    #[test]
    fn test_load_json_abort_is_error() {
        let (_dir, ns) = setup();
        let registry = Arc::new(SchemaRegistry::new());
        registry.register(
            "6_AG_out",
            ChannelContract::new(ViolationPolicy::Abort)
                .with_schema("*", json!({"type": "object", "required": ["analysis"]})),
        );
        ns.channel("6_AG_out")
            .write(&[ArtifactPayload::new("analysis.json", b"not json".to_vec())])
            .unwrap();

        let reader = ChannelReader::new(ns, registry);
        let err = reader.load_json("6_AG_out", "analysis.json").unwrap_err();
        match err {
            SketchflowError::SchemaViolation(v) => {
                assert_eq!(v.artifact, "analysis.json");
                assert!(v.violations[0].contains("invalid JSON"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_json_missing_is_none() {
        let (_dir, ns) = setup();
        let reader = ChannelReader::new(ns, Arc::new(SchemaRegistry::new()));
        assert!(reader.load_json("4_CEX_out", "colors.json").unwrap().is_none());
    }

    #[test]
    fn test_check_channel_counts_only_contracted_artifacts() {
        let (_dir, ns) = setup();
        let registry = Arc::new(SchemaRegistry::new());
        registry.register(
            "4_CEX_out",
            ChannelContract::new(ViolationPolicy::Tolerate)
                .with_schema("*", json!({"type": "array"})),
        );
        ns.channel("4_CEX_out")
            .write(&[
                ArtifactPayload::json("drawing.json", &json!([1, 2])).unwrap(),
                ArtifactPayload::json("objects.json", &json!({"a": 1})).unwrap(),
                ArtifactPayload::new("palette.png", vec![0u8; 4]),
            ])
            .unwrap();

        let reader = ChannelReader::new(ns, registry);
        let check = reader.check_channel("4_CEX_out").unwrap();
        assert_eq!(check.checked, 2);
        assert_eq!(check.tolerated.len(), 1);
        assert_eq!(check.tolerated[0].artifact, "objects.json");
    }
}
