//! Flow documents: the versioned, declarative graph a conversation runs on
//!
//! A document is `{schema_version, id, entry, nodes, edges, metadata}`. Parsing
//! is strict: an unsupported schema version or an unknown node kind is a
//! `DocumentError`, never a silent coercion.

use super::guard::Guard;
use super::paths::PathDefinition;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

/// The only schema version this engine understands
pub const SUPPORTED_SCHEMA_VERSION: u64 = 1;

/// Node kinds accepted in the `kind` field
pub const NODE_KINDS: &[&str] = &["question", "decision", "terminal", "action", "subflow"];

/// Errors that make a document structurally unusable.
///
/// Anything that can still be indexed is reported later by the compiler as a
/// `ValidationError` instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DocumentError {
    #[error("Failed to parse flow document: {0}")]
    Json(String),

    #[error("Unsupported schema_version {found} (expected {SUPPORTED_SCHEMA_VERSION})")]
    UnsupportedSchemaVersion { found: String },

    #[error("Flow document is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Node #{index} has no string 'id'")]
    MissingNodeId { index: usize },

    #[error("Node '{node_id}' has unknown kind '{kind}' (expected one of: question, decision, terminal, action, subflow)")]
    UnknownNodeKind { node_id: String, kind: String },

    #[error("Node '{node_id}' is invalid: {message}")]
    InvalidNode { node_id: String, message: String },

    #[error("Edge #{index} is invalid: {message}")]
    InvalidEdge { index: usize, message: String },
}

// ============================================================================
// Nodes
// ============================================================================

/// A single conversational state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default = "default_true")]
    pub revisitable: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(flatten)]
    pub kind: NodeKind,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

impl Node {
    /// Kind name as it appears in documents
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Question(_) => "question",
            NodeKind::Decision(_) => "decision",
            NodeKind::Terminal(_) => "terminal",
            NodeKind::Action(_) => "action",
            NodeKind::Subflow(_) => "subflow",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal(_))
    }

    /// Human-readable name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    pub fn as_question(&self) -> Option<&QuestionNode> {
        match &self.kind {
            NodeKind::Question(q) => Some(q),
            _ => None,
        }
    }

    /// Path definitions, if this node is a path-selection decision point
    pub fn paths(&self) -> &[PathDefinition] {
        match &self.kind {
            NodeKind::Decision(d) => &d.paths,
            _ => &[],
        }
    }

    /// Prompt shown to the Responder for this node
    pub fn prompt(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Question(q) => Some(q.prompt.as_str()),
            NodeKind::Decision(d) => d.decision_prompt.as_deref(),
            NodeKind::Terminal(t) => t.message.as_deref(),
            NodeKind::Action(_) | NodeKind::Subflow(_) => None,
        }
    }
}

/// Kind-specific node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Question(QuestionNode),
    Decision(DecisionNode),
    Terminal(TerminalNode),
    Action(ActionNode),
    Subflow(SubflowNode),
}

/// How a Question's answer is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Text,
    Number,
    Integer,
    Boolean,
    Email,
    Phone,
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionNode {
    /// Answer key this question fills
    pub key: String,
    pub prompt: String,
    /// Regex the textual answer must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Answer keys that should be known before asking
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

impl QuestionNode {
    /// Check a proposed answer against the data type, allowed values and
    /// validator, returning the value to store.
    ///
    /// Strings are coerced to the declared type (`"42"` becomes `42` for a
    /// number) and allowed values are returned in their declared spelling.
    pub fn normalize(&self, value: &Value) -> Result<Value, String> {
        let typed = coerce(self.data_type, value)?;

        let text = match &typed {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        if !self.allowed_values.is_empty() {
            let wanted = text.trim().to_lowercase();
            let Some(allowed) = self
                .allowed_values
                .iter()
                .find(|a| a.to_lowercase() == wanted)
            else {
                return Err(format!(
                    "'{text}' is not one of: {}",
                    self.allowed_values.join(", ")
                ));
            };
            if typed.is_string() {
                return self.check_validator(allowed).map(|()| Value::String(allowed.clone()));
            }
        }

        self.check_validator(&text)?;
        Ok(typed)
    }

    fn check_validator(&self, text: &str) -> Result<(), String> {
        let Some(pattern) = &self.validator else {
            return Ok(());
        };
        let re = cached_regex(pattern).map_err(|e| format!("invalid validator: {e}"))?;
        if re.is_match(text) {
            Ok(())
        } else {
            Err(format!("'{text}' does not match {pattern}"))
        }
    }
}

fn coerce(data_type: DataType, value: &Value) -> Result<Value, String> {
    let text = value.as_str().map(str::trim);
    match data_type {
        DataType::Text => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            Value::Number(_) | Value::Bool(_) => Ok(Value::String(value.to_string())),
            _ => Ok(value.clone()),
        },
        DataType::Number => match (value, text) {
            (Value::Number(_), _) => Ok(value.clone()),
            (_, Some(t)) => t
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{t}' is not a number")),
            _ => Err(format!("{value} is not a number")),
        },
        DataType::Integer => match (value, text) {
            (Value::Number(n), _) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (_, Some(t)) => t
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{t}' is not a whole number")),
            _ => Err(format!("{value} is not a whole number")),
        },
        DataType::Boolean => match (value, text.map(str::to_lowercase).as_deref()) {
            (Value::Bool(_), _) => Ok(value.clone()),
            (_, Some("true" | "yes" | "y" | "1")) => Ok(Value::Bool(true)),
            (_, Some("false" | "no" | "n" | "0")) => Ok(Value::Bool(false)),
            _ => Err(format!("{value} is not yes or no")),
        },
        DataType::Email => match text {
            Some(t) if email_pattern().is_match(t) => Ok(Value::String(t.to_lowercase())),
            _ => Err(format!("{value} is not an email address")),
        },
        DataType::Phone => {
            let raw = match value {
                Value::Number(n) => n.to_string(),
                _ => text.unwrap_or_default().to_string(),
            };
            let digits = raw.chars().filter(char::is_ascii_digit).count();
            let clean = raw
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.'));
            if clean && (7..=15).contains(&digits) {
                Ok(Value::String(raw))
            } else {
                Err(format!("'{raw}' is not a phone number"))
            }
        }
        DataType::Date => match text {
            Some(t) if chrono::NaiveDate::parse_from_str(t, "%Y-%m-%d").is_ok() => {
                Ok(Value::String(t.to_string()))
            }
            _ => Err(format!("{value} is not a YYYY-MM-DD date")),
        },
    }
}

fn regex_cache() -> &'static Mutex<HashMap<String, Regex>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    CACHE.get_or_init(Mutex::default)
}

/// Compile `pattern`, reusing an earlier compilation of the same pattern.
///
/// Validators and guard keywords come from loaded flow documents, so the
/// cache stays as small as the flow set and is never evicted.
pub(crate) fn cached_regex(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = regex_cache().lock().unwrap().get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    regex_cache()
        .lock()
        .unwrap()
        .insert(pattern.to_string(), re.clone());
    Ok(re)
}

#[cfg(test)]
pub(crate) fn is_regex_cached(pattern: &str) -> bool {
    regex_cache().lock().unwrap().contains_key(pattern)
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    #[default]
    RuleBased,
    LlmAssisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    #[serde(default)]
    pub decision_type: DecisionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_prompt: Option<String>,
    /// Mutually exclusive branches selected under this decision point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalNode {
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_flow: Option<String>,
    #[serde(default)]
    pub handoff_required: bool,
    /// Closing message delivered when the node is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Name of the registered executor to dispatch to
    pub action_type: String,
    #[serde(default)]
    pub action_config: Map<String, Value>,
    /// Keys copied from the result data into answers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowNode {
    pub flow_ref: String,
    /// child answer key -> parent answer key
    #[serde(default)]
    pub input_mapping: Map<String, Value>,
    /// parent answer key -> child answer key
    #[serde(default)]
    pub output_mapping: Map<String, Value>,
}

// ============================================================================
// Edges
// ============================================================================

/// A directed, guarded transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub guard: Guard,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub condition_description: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            priority: 0,
            guard: Guard::always(),
            label: String::new(),
            condition_description: String::new(),
        }
    }

    #[must_use]
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

// ============================================================================
// Document
// ============================================================================

/// A parsed, not yet validated, flow document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDocument {
    pub schema_version: u64,
    pub id: String,
    pub entry: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub metadata: Map<String, Value>,
}

impl FlowDocument {
    /// Parse a document from JSON text
    pub fn parse(json: &str) -> Result<Self, DocumentError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| DocumentError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a document from an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(mut root) = value else {
            return Err(DocumentError::Json("document must be a JSON object".to_string()));
        };

        let schema_version = parse_schema_version(root.get("schema_version"))?;

        let id = take_string(&mut root, "id")?;
        let entry = take_string(&mut root, "entry")?;

        let raw_nodes = match root.remove("nodes") {
            Some(Value::Array(nodes)) => nodes,
            Some(_) => return Err(DocumentError::Json("'nodes' must be an array".to_string())),
            None => return Err(DocumentError::MissingField("nodes")),
        };
        let nodes = raw_nodes
            .into_iter()
            .enumerate()
            .map(|(index, raw)| parse_node(index, raw))
            .collect::<Result<Vec<_>, _>>()?;

        let edges = match root.remove("edges") {
            Some(Value::Array(edges)) => edges
                .into_iter()
                .enumerate()
                .map(|(index, raw)| {
                    serde_json::from_value::<Edge>(raw).map_err(|e| DocumentError::InvalidEdge {
                        index,
                        message: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(DocumentError::Json("'edges' must be an array".to_string())),
        };

        let metadata = match root.remove("metadata") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(DocumentError::Json("'metadata' must be an object".to_string())),
        };

        Ok(Self {
            schema_version,
            id,
            entry,
            nodes,
            edges,
            metadata,
        })
    }
}

fn parse_schema_version(value: Option<&Value>) -> Result<u64, DocumentError> {
    let version = match value {
        None => return Err(DocumentError::MissingField("schema_version")),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match version {
        Some(SUPPORTED_SCHEMA_VERSION) => Ok(SUPPORTED_SCHEMA_VERSION),
        _ => Err(DocumentError::UnsupportedSchemaVersion {
            found: value.map(ToString::to_string).unwrap_or_default(),
        }),
    }
}

fn take_string(root: &mut Map<String, Value>, field: &'static str) -> Result<String, DocumentError> {
    match root.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(DocumentError::MissingField(field)),
    }
}

fn parse_node(index: usize, raw: Value) -> Result<Node, DocumentError> {
    let node_id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or(DocumentError::MissingNodeId { index })?;

    // Check the kind up front so the error names the node instead of serde's variant list
    let kind = raw.get("kind").and_then(Value::as_str).unwrap_or_default();
    if !NODE_KINDS.contains(&kind) {
        return Err(DocumentError::UnknownNodeKind {
            node_id,
            kind: kind.to_string(),
        });
    }

    serde_json::from_value::<Node>(raw).map_err(|e| DocumentError::InvalidNode {
        node_id,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "schema_version": 1,
            "id": "greeting",
            "entry": "ask_name",
            "nodes": [
                {"id": "ask_name", "kind": "question", "key": "name", "prompt": "What is your name?"},
                {"id": "done", "kind": "terminal", "reason": "collected"}
            ],
            "edges": [
                {"source": "ask_name", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "name"}}}
            ]
        })
    }

    #[test]
    fn test_parse_minimal_document() {
        let doc = FlowDocument::from_value(minimal()).unwrap();
        assert_eq!(doc.id, "greeting");
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[0].kind_name(), "question");
        assert!(doc.nodes[0].revisitable);
        assert_eq!(doc.nodes[0].max_attempts, 3);
        assert_eq!(doc.edges[0].guard.function, "answers_has");
        assert!(doc.metadata.is_empty());
    }

    #[test]
    fn test_string_schema_version_accepted() {
        let mut doc = minimal();
        doc["schema_version"] = json!("1");
        assert!(FlowDocument::from_value(doc).is_ok());
    }

    #[test]
    fn test_unsupported_schema_version_rejected() {
        let mut doc = minimal();
        doc["schema_version"] = json!(2);
        let err = FlowDocument::from_value(doc).unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedSchemaVersion { .. }));
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_unknown_node_kind_names_the_node() {
        let mut doc = minimal();
        doc["nodes"][1]["kind"] = json!("teleport");
        let err = FlowDocument::from_value(doc).unwrap_err();
        assert_eq!(
            err,
            DocumentError::UnknownNodeKind {
                node_id: "done".to_string(),
                kind: "teleport".to_string()
            }
        );
    }

    #[test]
    fn test_question_without_key_is_invalid() {
        let mut doc = minimal();
        doc["nodes"][0] = json!({"id": "ask_name", "kind": "question", "prompt": "?"});
        let err = FlowDocument::from_value(doc).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidNode { ref node_id, .. } if node_id == "ask_name"));
    }

    #[test]
    fn test_edge_defaults_to_always_guard() {
        let mut doc = minimal();
        doc["edges"] = json!([{"source": "ask_name", "target": "done"}]);
        let doc = FlowDocument::from_value(doc).unwrap();
        assert_eq!(doc.edges[0].guard, Guard::always());
        assert_eq!(doc.edges[0].priority, 0);
    }

    #[test]
    fn test_unparseable_json() {
        assert!(matches!(FlowDocument::parse("{nope"), Err(DocumentError::Json(_))));
    }

    #[test]
    fn test_node_round_trips_kind_tag() {
        let doc = FlowDocument::from_value(minimal()).unwrap();
        let value = serde_json::to_value(&doc.nodes[1]).unwrap();
        assert_eq!(value["kind"], "terminal");
        assert_eq!(value["success"], true);
    }

    fn question(data_type: DataType) -> QuestionNode {
        QuestionNode {
            key: "k".into(),
            prompt: "?".into(),
            validator: None,
            allowed_values: vec![],
            data_type,
            required: true,
            dependencies: vec![],
            priority: 0,
        }
    }

    #[test]
    fn test_normalize_coerces_types() {
        assert_eq!(question(DataType::Integer).normalize(&json!("42")).unwrap(), json!(42));
        assert!(question(DataType::Integer).normalize(&json!("4.2")).is_err());
        assert_eq!(question(DataType::Number).normalize(&json!("4,5")).unwrap(), json!(4.5));
        assert_eq!(question(DataType::Boolean).normalize(&json!("Yes")).unwrap(), json!(true));
        assert_eq!(
            question(DataType::Email).normalize(&json!(" Ana@Example.com ")).unwrap(),
            json!("ana@example.com")
        );
        assert!(question(DataType::Email).normalize(&json!("ana@")).is_err());
        assert!(question(DataType::Phone).normalize(&json!("+55 (11) 91234-5678")).is_ok());
        assert!(question(DataType::Phone).normalize(&json!("call me")).is_err());
        assert!(question(DataType::Date).normalize(&json!("2024-02-30")).is_err());
        assert!(question(DataType::Date).normalize(&json!("2024-02-29")).is_ok());
    }

    #[test]
    fn test_normalize_allowed_values_and_validator() {
        let mut q = question(DataType::Text);
        q.allowed_values = vec!["Small".into(), "Large".into()];
        assert_eq!(q.normalize(&json!("small")).unwrap(), json!("Small"));
        assert!(q.normalize(&json!("medium")).is_err());

        let mut q = question(DataType::Text);
        q.validator = Some(r"^\d{5}-\d{3}$".into());
        assert!(q.normalize(&json!("01310-100")).is_ok());
        assert!(q.normalize(&json!("0131")).is_err());
    }

}
