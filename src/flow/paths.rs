//! Multi-path subgraphs
//!
//! A Decision node can declare several mutually exclusive paths. One path is
//! active at a time; after `lock_threshold` turns inside it the choice becomes
//! immutable for ordinary turns.

use super::guard::{Guard, GuardEvaluator, GuardScope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_lock_threshold() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// One branch under a path-selection decision point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathDefinition {
    pub name: String,
    #[serde(default)]
    pub label: String,
    /// Node the path starts at (local id or `flow_ref/node_id`)
    pub target: String,
    /// The path is selected when any of these holds against the user's input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<Guard>,
    /// Path-scoped answers, cleared when the conversation switches away
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer_keys: Vec<String>,
    #[serde(default = "default_lock_threshold")]
    pub lock_threshold: u32,
    #[serde(default = "default_true")]
    pub allow_switch_before_lock: bool,
}

impl PathDefinition {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            target: target.into(),
            entry: Vec::new(),
            answer_keys: Vec::new(),
            lock_threshold: default_lock_threshold(),
            allow_switch_before_lock: true,
        }
    }

    #[must_use]
    pub fn with_entry(mut self, guard: Guard) -> Self {
        self.entry.push(guard);
        self
    }

    #[must_use]
    pub fn with_answer_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.answer_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }

    /// Match by name or label, case-insensitive
    pub fn matches_name(&self, wanted: &str) -> bool {
        let wanted = wanted.trim();
        self.name.eq_ignore_ascii_case(wanted)
            || (!self.label.is_empty() && self.label.eq_ignore_ascii_case(wanted))
    }
}

/// Path bookkeeping carried in the conversation context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathState {
    #[serde(default)]
    pub active_path: Option<String>,
    /// Decision node that owns the active path
    #[serde(default)]
    pub path_owner: Option<String>,
    #[serde(default)]
    pub path_locked: bool,
    #[serde(default)]
    pub turns_in_path: u32,
}

impl PathState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Why a switch request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchRejection {
    /// The active path reached its lock threshold
    Locked,
    /// The active path does not allow switching even before the lock
    SwitchingDisabled,
    /// `force` was requested on a non-admin turn
    ForceRequiresAdmin,
}

impl SwitchRejection {
    pub fn describe(self) -> &'static str {
        match self {
            SwitchRejection::Locked => "the current path is locked",
            SwitchRejection::SwitchingDisabled => "the current path does not allow switching",
            SwitchRejection::ForceRequiresAdmin => "forcing a path switch requires an admin turn",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchVerdict<'p> {
    /// Switch to this path
    Allowed(&'p PathDefinition),
    /// Requested path is already active
    Unchanged,
    Rejected(SwitchRejection),
}

/// Stateless path selection and locking rules
pub struct PathSelector;

impl PathSelector {
    /// First path (in declaration order) whose entry predicates hold
    pub fn select_entry<'p>(
        paths: &'p [PathDefinition],
        evaluator: &GuardEvaluator,
        scope: &GuardScope<'_>,
    ) -> Option<&'p PathDefinition> {
        paths
            .iter()
            .find(|p| p.entry.iter().any(|g| evaluator.evaluate(g, scope)))
    }

    pub fn find<'p>(paths: &'p [PathDefinition], wanted: &str) -> Option<&'p PathDefinition> {
        paths
            .iter()
            .find(|p| p.name == wanted)
            .or_else(|| paths.iter().find(|p| p.matches_name(wanted)))
    }

    /// Whether the active path has become immutable
    pub fn is_locked(state: &PathState, active: Option<&PathDefinition>) -> bool {
        state.path_locked || active.is_some_and(|p| state.turns_in_path >= p.lock_threshold)
    }

    /// Decide whether an explicit switch request may proceed.
    ///
    /// `force` only has effect on admin turns, where it overrides both the lock
    /// and `allow_switch_before_lock`.
    pub fn evaluate_switch<'p>(
        state: &PathState,
        paths: &'p [PathDefinition],
        requested: &'p PathDefinition,
        force: bool,
        is_admin: bool,
    ) -> SwitchVerdict<'p> {
        if state.active_path.as_deref() == Some(requested.name.as_str()) {
            return SwitchVerdict::Unchanged;
        }
        if force && !is_admin {
            return SwitchVerdict::Rejected(SwitchRejection::ForceRequiresAdmin);
        }
        let Some(active_name) = state.active_path.as_deref() else {
            return SwitchVerdict::Allowed(requested);
        };
        if force {
            return SwitchVerdict::Allowed(requested);
        }

        let active = Self::find(paths, active_name);
        if Self::is_locked(state, active) {
            return SwitchVerdict::Rejected(SwitchRejection::Locked);
        }
        if active.is_some_and(|p| !p.allow_switch_before_lock) {
            return SwitchVerdict::Rejected(SwitchRejection::SwitchingDisabled);
        }
        SwitchVerdict::Allowed(requested)
    }

    /// Make `path` active, resetting the answers scoped to the previous path.
    ///
    /// Returns the keys that were cleared.
    pub fn activate(
        state: &mut PathState,
        answers: &mut Map<String, Value>,
        paths: &[PathDefinition],
        owner: &str,
        path: &PathDefinition,
    ) -> Vec<String> {
        let mut cleared = Vec::new();
        if let Some(previous) = state.active_path.as_deref().and_then(|n| Self::find(paths, n)) {
            for key in &previous.answer_keys {
                // Keys shared with the new path are global to both
                if path.answer_keys.contains(key) {
                    continue;
                }
                if answers.remove(key).is_some() {
                    cleared.push(key.clone());
                }
            }
        }
        state.active_path = Some(path.name.clone());
        state.path_owner = Some(owner.to_string());
        state.path_locked = false;
        state.turns_in_path = 0;
        cleared
    }

    /// Count one completed turn inside the active path
    pub fn record_turn(state: &mut PathState, paths: &[PathDefinition]) {
        let Some(active) = state.active_path.as_deref() else {
            return;
        };
        state.turns_in_path = state.turns_in_path.saturating_add(1);
        if let Some(def) = Self::find(paths, active) {
            if state.turns_in_path >= def.lock_threshold {
                state.path_locked = true;
            }
        }
    }
}
