//! Channel schema registry and JSON schema checks.
//!
//! Schemas are owned by the producing stage but enforced where the data is
//! consumed. The registry is keyed by channel name; each contract carries
//! its own violation policy.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wildcard artifact key applying to every JSON artifact of a channel.
pub const ANY_ARTIFACT: &str = "*";

/// What a consumer does when a channel artifact violates its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Log the violation and keep going.
    #[default]
    Tolerate,
    /// Treat the violation as fatal for the consumer.
    Abort,
}

impl std::fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tolerate => write!(f, "tolerate"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Schemas and policy for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelContract {
    /// Violation policy for all artifacts in the channel.
    #[serde(default)]
    pub policy: ViolationPolicy,

    /// Artifact path (relative to the channel) to JSON schema.
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
}

impl ChannelContract {
    /// Creates an empty contract with the given policy.
    #[must_use]
    pub fn new(policy: ViolationPolicy) -> Self {
        Self {
            policy,
            artifacts: BTreeMap::new(),
        }
    }

    /// Adds a schema for an artifact path (or [`ANY_ARTIFACT`]).
    #[must_use]
    pub fn with_schema(mut self, artifact: impl Into<String>, schema: Value) -> Self {
        self.artifacts.insert(artifact.into(), schema);
        self
    }

    /// Schema governing an artifact, falling back to the wildcard for
    /// `.json` artifacts.
    #[must_use]
    pub fn schema_for(&self, artifact: &str) -> Option<&Value> {
        self.artifacts.get(artifact).or_else(|| {
            if artifact.ends_with(".json") {
                self.artifacts.get(ANY_ARTIFACT)
            } else {
                None
            }
        })
    }
}

/// In-memory registry of channel contracts.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    contracts: RwLock<BTreeMap<String, ChannelContract>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from configured contracts.
    #[must_use]
    pub fn from_contracts(contracts: BTreeMap<String, ChannelContract>) -> Self {
        Self {
            contracts: RwLock::new(contracts),
        }
    }

    /// Register or replace the contract of a channel.
    pub fn register(&self, channel: impl Into<String>, contract: ChannelContract) {
        self.contracts.write().insert(channel.into(), contract);
    }

    /// Fetch the contract of a channel.
    #[must_use]
    pub fn contract(&self, channel: &str) -> Option<ChannelContract> {
        self.contracts.read().get(channel).cloned()
    }

    /// Policy for a channel (tolerate when no contract exists).
    #[must_use]
    pub fn policy(&self, channel: &str) -> ViolationPolicy {
        self.contracts
            .read()
            .get(channel)
            .map(|c| c.policy)
            .unwrap_or_default()
    }

    /// Returns true if the channel has a contract.
    #[must_use]
    pub fn has_contract(&self, channel: &str) -> bool {
        self.contracts.read().contains_key(channel)
    }

    /// Returns the number of registered contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.read().len()
    }

    /// Returns true if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.read().is_empty()
    }
}

/// Validates `instance` against `schema`.
///
/// Supports the subset of JSON Schema used by stage contracts: `type`,
/// `enum`, `required`, `properties`, `additionalProperties: false`,
/// `items`, `minItems`, `maxItems`, `minLength`, `minimum`, `maximum`.
/// Returns one message per violation, prefixed with a JSON pointer.
#[must_use]
pub fn validate(instance: &Value, schema: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    check(instance, schema, "$", &mut violations);
    violations
}

fn check(instance: &Value, schema: &Value, pointer: &str, out: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        // `true`/`{}` style schemas accept anything
        return;
    };

    if let Some(expected) = schema.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(arr) => arr.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|n| type_matches(instance, n)) {
            out.push(format!(
                "{pointer}: expected {}, found {}",
                names.join(" or "),
                type_name(instance)
            ));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(instance) {
            out.push(format!("{pointer}: value {instance} is not one of the allowed values"));
        }
    }

    match instance {
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        out.push(format!("{pointer}: missing required property '{key}'"));
                    }
                }
            }
            let props = schema.get("properties").and_then(Value::as_object);
            if let Some(props) = props {
                for (key, sub_schema) in props {
                    if let Some(value) = map.get(key) {
                        check(value, sub_schema, &format!("{pointer}/{key}"), out);
                    }
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in map.keys() {
                    if !props.is_some_and(|p| p.contains_key(key)) {
                        out.push(format!("{pointer}: unexpected property '{key}'"));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    out.push(format!(
                        "{pointer}: expected at least {min} items, found {}",
                        items.len()
                    ));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if (items.len() as u64) > max {
                    out.push(format!(
                        "{pointer}: expected at most {max} items, found {}",
                        items.len()
                    ));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    check(item, item_schema, &format!("{pointer}/{idx}"), out);
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min {
                    out.push(format!("{pointer}: string shorter than {min}"));
                }
            }
        }
        Value::Number(n) => {
            let Some(v) = n.as_f64() else { return };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if v < min {
                    out.push(format!("{pointer}: {v} is below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if v > max {
                    out.push(format!("{pointer}: {v} is above maximum {max}"));
                }
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn type_matches(instance: &Value, name: &str) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Number(_) => "number",
    }
}
