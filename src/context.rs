//! Per-conversation state
//!
//! A `FlowContext` is loaded at the start of a turn, mutated once by the
//! runner, and saved back. It is plain data; all decisions about how it
//! changes live in the state machine.

use crate::flow::{is_filled, CompiledFlow, PathState};
use crate::state_machine::TurnState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

/// Who produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Marks a conversation running inside a subflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubflowFrame {
    /// Subflow name, relative to the enclosing graph
    pub flow_ref: String,
    /// Subflow node in the enclosing graph to resume from
    pub return_node: String,
}

/// Identifies a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Key used for the distributed session lock
    pub fn lock_key(&self) -> String {
        format!("session:{}:{}", self.user_id, self.session_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// Mutable per-conversation state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub session_id: String,
    pub flow_id: String,
    #[serde(default)]
    pub channel_id: String,
    pub current_node_id: String,
    #[serde(default)]
    pub answers: Map<String, Value>,
    #[serde(default)]
    pub pending_field: Option<String>,
    #[serde(flatten)]
    pub path: PathState,
    /// Most recent last
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    #[serde(default)]
    pub state: TurnState,
    /// Innermost subflow last
    #[serde(default)]
    pub frames: Vec<SubflowFrame>,
    /// Unproductive turns per question node
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Questions skipped after running out of attempts
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub communication_style: Option<String>,
    /// Recently processed inbound message ids, oldest first
    #[serde(default)]
    pub processed_message_ids: VecDeque<String>,
    #[serde(default)]
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How many processed message ids are remembered per session
pub const PROCESSED_ID_MEMORY: usize = 64;

impl FlowContext {
    /// A fresh conversation positioned at the flow's entry node
    pub fn new(key: &SessionKey, flow: &CompiledFlow) -> Self {
        let now = Utc::now();
        let mut ctx = Self {
            user_id: key.user_id.clone(),
            tenant_id: String::new(),
            session_id: key.session_id.clone(),
            flow_id: flow.id.clone(),
            channel_id: String::new(),
            current_node_id: flow.entry.clone(),
            answers: Map::new(),
            pending_field: None,
            path: PathState::default(),
            history: VecDeque::new(),
            state: TurnState::AwaitingInput,
            frames: Vec::new(),
            attempts: BTreeMap::new(),
            skipped: Vec::new(),
            communication_style: None,
            processed_message_ids: VecDeque::new(),
            turn_count: 0,
            created_at: now,
            updated_at: now,
        };
        ctx.sync_pending_field(flow);
        ctx
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.session_id)
    }

    /// Subflow names from the root graph down to the active one
    pub fn frame_path(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|f| f.flow_ref.as_str())
    }

    /// The graph the current node lives in
    pub fn active_graph<'f>(&self, root: &'f CompiledFlow) -> Option<&'f CompiledFlow> {
        root.graph_at(self.frame_path())
    }

    /// Point `pending_field` at the current node's key if it is a question
    /// whose answer is still missing
    pub fn sync_pending_field(&mut self, root: &CompiledFlow) {
        let key = self
            .active_graph(root)
            .and_then(|g| g.node(&self.current_node_id))
            .and_then(|n| n.as_question())
            .map(|q| q.key.clone());
        self.pending_field = key.filter(|k| !self.answers.get(k).is_some_and(is_filled));
    }

    /// Append to history, dropping the oldest entries beyond `limit`
    pub fn push_history(&mut self, role: Role, text: impl Into<String>, limit: usize) {
        self.history.push_back(HistoryEntry {
            role,
            text: text.into(),
            node_id: Some(self.current_node_id.clone()),
            at: Utc::now(),
        });
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
        }
    }

    /// The last `n` history entries, oldest first
    pub fn recent_history(&self, n: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().skip(self.history.len().saturating_sub(n))
    }

    pub fn has_processed(&self, message_id: &str) -> bool {
        self.processed_message_ids.iter().any(|id| id == message_id)
    }

    pub fn remember_message_id(&mut self, message_id: impl Into<String>) {
        self.processed_message_ids.push_back(message_id.into());
        while self.processed_message_ids.len() > PROCESSED_ID_MEMORY {
            self.processed_message_ids.pop_front();
        }
    }

    /// Start over at the entry of `flow`, optionally keeping answers.
    ///
    /// History and identity survive; everything positional is reset.
    pub fn restart(&mut self, flow: &CompiledFlow, keep_answers: bool) {
        self.flow_id = flow.id.clone();
        self.current_node_id = flow.entry.clone();
        if !keep_answers {
            self.answers.clear();
        }
        self.path.clear();
        self.frames.clear();
        self.attempts.clear();
        self.skipped.clear();
        self.state = TurnState::AwaitingInput;
        self.sync_pending_field(flow);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Answer application
// ============================================================================

/// What a merge did to the answers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Keys written by this merge
    pub applied: Vec<String>,
    /// Keys left alone because they already held a value
    pub kept: Vec<String>,
    pub pending_cleared: bool,
}

/// Conservative merge of LLM-proposed answers.
///
/// A key that already holds a non-empty value is never overwritten here; only
/// [`correct_answer`] may do that. Empty incoming values are ignored.
/// `pending_field` is cleared once the field it names is filled.
pub fn apply_updates(
    answers: &mut Map<String, Value>,
    updates: &Map<String, Value>,
    pending_field: &mut Option<String>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for (key, value) in updates {
        if !is_filled(value) {
            continue;
        }
        if answers.get(key).is_some_and(is_filled) {
            if answers.get(key) != Some(value) {
                outcome.kept.push(key.clone());
            }
            continue;
        }
        answers.insert(key.clone(), value.clone());
        outcome.applied.push(key.clone());
    }
    outcome.pending_cleared = clear_pending_if_filled(answers, pending_field);
    outcome
}

/// Explicit correction: overwrites whatever the key held
pub fn correct_answer(
    answers: &mut Map<String, Value>,
    key: &str,
    value: Value,
    pending_field: &mut Option<String>,
) -> Option<Value> {
    let previous = answers.insert(key.to_string(), value);
    clear_pending_if_filled(answers, pending_field);
    previous
}

fn clear_pending_if_filled(
    answers: &Map<String, Value>,
    pending_field: &mut Option<String>,
) -> bool {
    let filled = pending_field
        .as_deref()
        .is_some_and(|k| answers.get(k).is_some_and(is_filled));
    if filled {
        *pending_field = None;
    }
    filled
}

/// Keys whose value changed between two answer maps.
///
/// Removed keys map to `null`.
pub fn diff_answers(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut diff = Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            diff.insert(key.clone(), Value::Null);
        }
    }
    diff
}
