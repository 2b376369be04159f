//! Pipeline configuration.
//!
//! Stages, channel contracts and gate thresholds are immutable
//! configuration loaded once at process start from YAML or JSON.

use crate::channel::{ChannelContract, ViolationPolicy};
use crate::errors::SketchflowError;
use crate::utils::is_contained_relative;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

#[allow(clippy::expect_used)]
static STAGE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("stage id pattern is valid"));

/// Main configuration for a pipeline deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Working directory for every stage process. Relative paths below
    /// resolve against it.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Channel namespace directory.
    #[serde(default = "default_namespace")]
    pub namespace: PathBuf,

    /// Retention store directory name inside the namespace.
    #[serde(default = "default_retention_dir")]
    pub retention_dir: String,

    /// Extensions that archive and purge never touch.
    #[serde(default = "default_excluded_extensions")]
    pub excluded_extensions: Vec<String>,

    /// Canonical input slot.
    #[serde(default)]
    pub input: InputSlotConfig,

    /// Channel that receives per-run log files.
    #[serde(default = "default_log_channel")]
    pub log_channel: String,

    /// Input gate thresholds.
    #[serde(default)]
    pub gate: GateConfig,

    /// Terminal artifact inspected after the last stage.
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Default per-stage deadline in seconds. `None` waits forever.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,

    /// Schema contracts keyed by channel name.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelContract>,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_namespace() -> PathBuf {
    PathBuf::from("shared_memory")
}

fn default_retention_dir() -> String {
    "8_History".to_string()
}

fn default_excluded_extensions() -> Vec<String> {
    vec![".py".to_string(), ".md".to_string()]
}

fn default_log_channel() -> String {
    "0_BE_out".to_string()
}

/// Location of the canonical input slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSlotConfig {
    /// Channel holding the input artifact.
    #[serde(default = "default_input_channel")]
    pub channel: String,

    /// Fixed file name of the input artifact.
    #[serde(default = "default_input_file")]
    pub file_name: String,
}

fn default_input_channel() -> String {
    "0_BE_input".to_string()
}

fn default_input_file() -> String {
    "original_input.png".to_string()
}

impl Default for InputSlotConfig {
    fn default() -> Self {
        Self {
            channel: default_input_channel(),
            file_name: default_input_file(),
        }
    }
}

/// Input gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Channel value at or above which a pixel counts as blank.
    #[serde(default = "default_white_threshold")]
    pub white_threshold: u8,

    /// Minimum percentage of non-blank pixels.
    #[serde(default = "default_min_non_blank_percent")]
    pub min_non_blank_percent: f64,

    /// Minimum width in pixels.
    #[serde(default = "default_min_side")]
    pub min_width: u32,

    /// Minimum height in pixels.
    #[serde(default = "default_min_side")]
    pub min_height: u32,
}

fn default_white_threshold() -> u8 {
    245
}

fn default_min_non_blank_percent() -> f64 {
    1.0
}

fn default_min_side() -> u32 {
    128
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            white_threshold: default_white_threshold(),
            min_non_blank_percent: default_min_non_blank_percent(),
            min_width: default_min_side(),
            min_height: default_min_side(),
        }
    }
}

/// The artifact that marks a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Channel holding the terminal artifact.
    #[serde(default = "default_terminal_channel")]
    pub channel: String,

    /// File name of the terminal artifact.
    #[serde(default = "default_terminal_file")]
    pub file_name: String,

    /// Text whose presence marks a fallback ("generation failed") artifact.
    #[serde(default = "default_sentinel")]
    pub sentinel: String,

    /// Number of leading bytes searched for the sentinel.
    #[serde(default = "default_inspect_bytes")]
    pub inspect_bytes: usize,
}

fn default_terminal_channel() -> String {
    "7_PDFG_out".to_string()
}

fn default_terminal_file() -> String {
    "full_analysis_report.pdf".to_string()
}

fn default_sentinel() -> String {
    "PDF generation failed".to_string()
}

fn default_inspect_bytes() -> usize {
    1000
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            channel: default_terminal_channel(),
            file_name: default_terminal_file(),
            sentinel: default_sentinel(),
            inspect_bytes: default_inspect_bytes(),
        }
    }
}

/// One ordered unit of pipeline work, executed as an external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stable stage identifier, reported by the status tracker.
    pub id: String,

    /// Progress text shown to pollers while the stage runs.
    #[serde(default)]
    pub description: Option<String>,

    /// Program followed by its fixed arguments.
    pub command: Vec<String>,

    /// Channels this stage consumes.
    #[serde(default)]
    pub reads: Vec<String>,

    /// The single channel this stage produces.
    pub writes: String,

    /// Deadline override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StageDefinition {
    /// Creates a stage definition.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        command: impl IntoIterator<Item = impl Into<String>>,
        writes: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: None,
            command: command.into_iter().map(Into::into).collect(),
            reads: Vec::new(),
            writes: writes.into(),
            timeout_secs: None,
        }
    }

    /// Sets the consumed channels.
    #[must_use]
    pub fn with_reads(mut self, reads: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.reads = reads.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the progress description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the deadline override.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The command rendered for log headers.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            namespace: default_namespace(),
            retention_dir: default_retention_dir(),
            excluded_extensions: default_excluded_extensions(),
            input: InputSlotConfig::default(),
            log_channel: default_log_channel(),
            gate: GateConfig::default(),
            terminal: TerminalConfig::default(),
            stage_timeout_secs: None,
            stages: Vec::new(),
            channels: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// A relative `project_root` is resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, SketchflowError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SketchflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Self = match ext {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| SketchflowError::Config(e.to_string()))?,
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents)?,
        };

        if config.project_root.is_relative() {
            if let Some(parent) = path.parent() {
                config.project_root = parent.join(&config.project_root);
            }
        }
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SketchflowError> {
        serde_yaml::from_str(yaml).map_err(|e| SketchflowError::Config(e.to_string()))
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, SketchflowError> {
        serde_yaml::to_string(self).map_err(|e| SketchflowError::Serialization(e.to_string()))
    }

    /// Sets the project root.
    #[must_use]
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    /// Sets the stage list.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageDefinition>) -> Self {
        self.stages = stages;
        self
    }

    /// Registers a channel contract.
    #[must_use]
    pub fn with_contract(mut self, channel: impl Into<String>, contract: ChannelContract) -> Self {
        self.channels.insert(channel.into(), contract);
        self
    }

    /// Absolute-or-relative path of the channel namespace.
    #[must_use]
    pub fn namespace_root(&self) -> PathBuf {
        self.project_root.join(&self.namespace)
    }

    /// Directory backing a named channel.
    #[must_use]
    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.namespace_root().join(channel)
    }

    /// Path of the canonical input slot.
    #[must_use]
    pub fn input_slot(&self) -> PathBuf {
        self.channel_dir(&self.input.channel).join(&self.input.file_name)
    }

    /// Directory receiving run logs.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.channel_dir(&self.log_channel)
    }

    /// Path of the terminal artifact.
    #[must_use]
    pub fn terminal_artifact(&self) -> PathBuf {
        self.channel_dir(&self.terminal.channel)
            .join(&self.terminal.file_name)
    }

    /// Path of the retention store.
    #[must_use]
    pub fn retention_root(&self) -> PathBuf {
        self.namespace_root().join(&self.retention_dir)
    }

    /// Effective deadline for a stage.
    #[must_use]
    pub fn stage_timeout(&self, stage: &StageDefinition) -> Option<Duration> {
        stage
            .timeout_secs
            .or(self.stage_timeout_secs)
            .map(Duration::from_secs)
    }

    /// Finds a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Validates stage ordering and channel ownership.
    pub fn validate(&self) -> Result<(), SketchflowError> {
        let fail = |msg: String| Err(SketchflowError::Config(msg));

        if self.stages.is_empty() {
            return fail("pipeline must define at least one stage".to_string());
        }
        if self.retention_dir.trim().is_empty() {
            return fail("retention_dir cannot be empty".to_string());
        }
        if !(0.0..=100.0).contains(&self.gate.min_non_blank_percent) {
            return fail(format!(
                "gate.min_non_blank_percent must be within 0..=100, got {}",
                self.gate.min_non_blank_percent
            ));
        }

        let reserved: HashSet<&str> = [
            self.input.channel.as_str(),
            self.log_channel.as_str(),
            self.retention_dir.as_str(),
        ]
        .into_iter()
        .collect();

        let mut ids = HashSet::new();
        let mut producers: HashMap<&str, &str> = HashMap::new();
        let mut available: HashSet<&str> = HashSet::new();
        available.insert(self.input.channel.as_str());

        for stage in &self.stages {
            if !STAGE_ID_PATTERN.is_match(&stage.id) {
                return fail(format!("invalid stage id '{}'", stage.id));
            }
            if !ids.insert(stage.id.as_str()) {
                return fail(format!("duplicate stage id '{}'", stage.id));
            }
            if stage.command.is_empty() || stage.command[0].trim().is_empty() {
                return fail(format!("stage '{}' has an empty command", stage.id));
            }
            let outside = std::iter::once(&stage.writes)
                .chain(&stage.reads)
                .find(|channel| !is_contained_relative(Path::new(channel.as_str())));
            if let Some(channel) = outside {
                return fail(format!(
                    "stage '{}' names channel '{}' outside the namespace",
                    stage.id, channel
                ));
            }
            if reserved.contains(stage.writes.as_str()) {
                return fail(format!(
                    "stage '{}' cannot write reserved channel '{}'",
                    stage.id, stage.writes
                ));
            }
            if let Some(owner) = producers.insert(stage.writes.as_str(), stage.id.as_str()) {
                return fail(format!(
                    "channel '{}' is written by both '{}' and '{}'",
                    stage.writes, owner, stage.id
                ));
            }
            for read in &stage.reads {
                if !available.contains(read.as_str()) {
                    return fail(format!(
                        "stage '{}' reads '{}' which no earlier stage produces",
                        stage.id, read
                    ));
                }
            }
            available.insert(stage.writes.as_str());
        }

        if !producers.contains_key(self.terminal.channel.as_str()) {
            return fail(format!(
                "terminal channel '{}' is not written by any stage",
                self.terminal.channel
            ));
        }

        Ok(())
    }

    /// The reference eight-stage drawing analysis pipeline.
    #[must_use]
    pub fn example() -> Self {
        let input = default_input_channel();
        let stages = vec![
            StageDefinition::new(
                "run_yolo_EMCLS",
                ["python3", "emotional_classification/run_yolo_EMCLS.py"],
                "1_EC_out",
            )
            .with_reads([input.as_str()])
            .with_description("Detecting overall emotion..."),
            StageDefinition::new(
                "run_OBJ_DET",
                ["python3", "object_detection/run_OBJ_DET.py"],
                "2_OBJ_DET_out",
            )
            .with_reads([input.as_str()])
            .with_description("Detecting objects in the drawing..."),
            StageDefinition::new(
                "run_FED",
                ["python3", "facial_expressions_detection/run_FED.py"],
                "3_FED_out",
            )
            .with_reads(["2_OBJ_DET_out"])
            .with_description("Analyzing facial expressions..."),
            StageDefinition::new(
                "run_CEX",
                ["python3", "colors_extractor/run_CEX.py"],
                "4_CEX_out",
            )
            .with_reads([input.as_str(), "2_OBJ_DET_out", "3_FED_out"])
            .with_description("Extracting color information..."),
            StageDefinition::new(
                "run_JB_A",
                ["python3", "json_builder/run_JB_A.py"],
                "5_JB_A_out",
            )
            .with_reads(["1_EC_out", "2_OBJ_DET_out", "3_FED_out", "4_CEX_out"])
            .with_description("Preparing intermediate data..."),
            StageDefinition::new(
                "run_AG",
                ["python3", "analysis_generator/run_AG.py"],
                "6_AG_out",
            )
            .with_reads(["5_JB_A_out"])
            .with_description("Generating emotional interpretation..."),
            StageDefinition::new(
                "run_JB_B",
                ["python3", "json_builder/run_JB_B.py"],
                "6_JB_B_out",
            )
            .with_reads(["5_JB_A_out", "6_AG_out"])
            .with_description("Finalizing analysis data..."),
            StageDefinition::new(
                "run_PDFG",
                ["python3", "pdf_generator/run_PDFG.py"],
                "7_PDFG_out",
            )
            .with_reads([input.as_str(), "2_OBJ_DET_out", "3_FED_out", "6_JB_B_out"])
            .with_description("Building the final PDF report..."),
        ];

        let ec_contract = ChannelContract::new(ViolationPolicy::Tolerate).with_schema(
            "EC_result.json",
            serde_json::json!({
                "type": "object",
                "required": ["emotion", "confidence"],
                "properties": {
                    "emotion": {"type": "string"},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                }
            }),
        );
        let ag_contract = ChannelContract::new(ViolationPolicy::Abort).with_schema(
            "*",
            serde_json::json!({"type": "object", "required": ["analysis"]}),
        );

        Self::default()
            .with_stages(stages)
            .with_contract("1_EC_out", ec_contract)
            .with_contract("6_AG_out", ag_contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_stage() -> PipelineConfig {
        PipelineConfig::default()
            .with_stages(vec![
                StageDefinition::new("first", ["sh", "a.sh"], "1_out").with_reads(["0_BE_input"]),
                StageDefinition::new("second", ["sh", "b.sh"], "7_PDFG_out").with_reads(["1_out"]),
            ])
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.gate.white_threshold, 245);
        assert_eq!(config.gate.min_width, 128);
        assert_eq!(config.retention_dir, "8_History");
        assert_eq!(
            config.input_slot(),
            PathBuf::from("./shared_memory/0_BE_input/original_input.png")
        );
    }

    #[test]
    fn test_example_is_valid() {
        let config = PipelineConfig::example();
        config.validate().unwrap();
        assert_eq!(config.stages.len(), 8);
        assert_eq!(config.stages[2].id, "run_FED");
    }

    #[test]
    fn test_yaml_round_trip_keeps_stage_order() {
        let yaml = PipelineConfig::example().to_yaml().unwrap();
        let parsed = PipelineConfig::from_yaml(&yaml).unwrap();
        let ids: Vec<_> = parsed.stages.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"run_yolo_EMCLS"));
        assert_eq!(ids.last(), Some(&"run_PDFG"));
        assert_eq!(
            parsed.channels.get("6_AG_out").map(|c| c.policy),
            Some(ViolationPolicy::Abort)
        );
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r"
stages:
  - id: only
    command: [sh, only.sh]
    reads: [0_BE_input]
    writes: 7_PDFG_out
";
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_channel, "0_BE_out");
        assert_eq!(config.terminal.inspect_bytes, 1000);
    }

    #[test]
    fn test_rejects_forward_read() {
        let mut config = two_stage();
        config.stages[0].reads.push("1_out".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no earlier stage"));
    }

    #[test]
    fn test_rejects_shared_channel() {
        let mut config = two_stage();
        config.stages[1].writes = "1_out".to_string();
        config.stages[1].reads.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids_and_reserved_writes() {
        let mut config = two_stage();
        config.stages[1].id = "first".to_string();
        assert!(config.validate().is_err());

        let mut config = two_stage();
        config.stages[0].writes = "0_BE_out".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_channels_outside_namespace() {
        for bad in ["../escape", "/etc", ""] {
            let mut config = two_stage();
            config.stages[1].reads = vec![bad.to_string()];
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("outside the namespace"), "{bad}");

            let mut config = two_stage();
            config.stages[0].writes = bad.to_string();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("outside the namespace"), "{bad}");
        }
    }

    #[test]
    fn test_rejects_missing_terminal_producer() {
        let mut config = two_stage();
        config.terminal.channel = "9_missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_timeout_precedence() {
        let mut config = two_stage();
        config.stage_timeout_secs = Some(30);
        config.stages[1].timeout_secs = Some(5);
        assert_eq!(config.stage_timeout(&config.stages[0]), Some(Duration::from_secs(30)));
        assert_eq!(config.stage_timeout(&config.stages[1]), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_from_file_resolves_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, two_stage().to_yaml().unwrap()).unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.project_root, dir.path().join("."));
    }
}
