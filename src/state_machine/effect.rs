//! Effects produced from sub-actions

use crate::flow::SwitchRejection;
use serde::Serialize;
use serde_json::{Map, Value};

/// State changes confined to the `FlowContext`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalEffect {
    /// Conservative answer merge
    MergeAnswers { updates: Map<String, Value> },

    /// Overwrite one answer
    CorrectAnswer { key: String, value: Value },

    /// Change `current_node_id` to a resolved reference
    MoveTo { target: String },

    /// Return to an answered question and wait for a new answer to `key`
    Revisit { target: String, key: String },

    /// Make a path active (resetting the previous path's answers)
    ActivatePath { owner: String, path: String },

    /// A switch request that was refused; recorded, changes nothing
    PathSwitchRejected {
        path: String,
        reason: SwitchRejection,
    },

    Escalate { reason: String },

    Finish { reason: String, success: bool },

    Restart { keep_answers: bool },

    SetCommunicationStyle { style: String },
}

/// The outcome of mapping one sub-action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    /// Applied synchronously to the context
    Local(LocalEffect),

    /// Dispatched to the executor registered under `action`
    External {
        action: String,
        parameters: Map<String, Value>,
    },
}

impl Effect {
    pub fn local(effect: LocalEffect) -> Self {
        Effect::Local(effect)
    }

    pub fn move_to(target: impl Into<String>) -> Self {
        Effect::Local(LocalEffect::MoveTo {
            target: target.into(),
        })
    }

    pub fn external(action: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Effect::External {
            action: action.into(),
            parameters,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Effect::External { .. })
    }
}
