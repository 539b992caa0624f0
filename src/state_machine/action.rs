//! Typed decisions returned by the Responder

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of the ordered sub-action list carried by a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SubAction {
    /// Remain on the current node
    Stay,

    /// Move along an edge, into a path, or back to a revisitable question
    Navigate { target: String },

    /// Conservative merge: existing non-empty answers are kept
    UpdateAnswers { updates: Map<String, Value> },

    /// Explicit correction that may overwrite an existing answer
    CorrectAnswer { key: String, value: Value },

    /// Explicit path correction signal
    SwitchPath {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Override a lock (admin turns only)
        #[serde(default)]
        force: bool,
    },

    RequestHumanHandoff {
        #[serde(default)]
        reason: String,
    },

    ConfirmCompletion,

    RestartConversation {
        #[serde(default)]
        keep_answers: bool,
    },

    /// Dispatch a registered external action
    ExecuteAction {
        name: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },

    // Admin only
    ModifyFlow { instruction: String },

    UpdateCommunicationStyle { style: String },
}

/// Every sub-action name the Responder accepts
pub const SUB_ACTION_NAMES: &[&str] = &[
    "stay",
    "navigate",
    "update_answers",
    "correct_answer",
    "switch_path",
    "request_human_handoff",
    "confirm_completion",
    "restart_conversation",
    "execute_action",
    "modify_flow",
    "update_communication_style",
];

/// Sub-actions dropped unless the turn is an admin turn
pub const ADMIN_SUB_ACTIONS: &[&str] = &["modify_flow", "update_communication_style"];

impl SubAction {
    pub fn name(&self) -> &'static str {
        match self {
            SubAction::Stay => "stay",
            SubAction::Navigate { .. } => "navigate",
            SubAction::UpdateAnswers { .. } => "update_answers",
            SubAction::CorrectAnswer { .. } => "correct_answer",
            SubAction::SwitchPath { .. } => "switch_path",
            SubAction::RequestHumanHandoff { .. } => "request_human_handoff",
            SubAction::ConfirmCompletion => "confirm_completion",
            SubAction::RestartConversation { .. } => "restart_conversation",
            SubAction::ExecuteAction { .. } => "execute_action",
            SubAction::ModifyFlow { .. } => "modify_flow",
            SubAction::UpdateCommunicationStyle { .. } => "update_communication_style",
        }
    }

    pub fn is_admin_only(&self) -> bool {
        ADMIN_SUB_ACTIONS.contains(&self.name())
    }
}

/// Typing simulation bounds for display messages
const MIN_DELAY_MS: u64 = 300;
const MAX_DELAY_MS: u64 = 3_000;
const PER_CHAR_DELAY_MS: u64 = 25;

/// Delay before showing a message, proportional to its length
pub fn typing_delay_ms(text: &str) -> u64 {
    let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
    chars
        .saturating_mul(PER_CHAR_DELAY_MS)
        .clamp(MIN_DELAY_MS, MAX_DELAY_MS)
}

/// A message shown to the user, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub text: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl DisplayMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay_ms: None,
        }
    }

    /// Fill in a missing delay from the text length
    #[must_use]
    pub fn with_default_delay(mut self) -> Self {
        if self.delay_ms.is_none() {
            self.delay_ms = Some(typing_delay_ms(&self.text));
        }
        self
    }
}

/// Apology used whenever a turn degrades to the safe default
pub const SAFE_DEFAULT_MESSAGE: &str =
    "Sorry, I didn't quite catch that. Could you say it again in a different way?";

/// The parsed result of one Responder call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// `None` when the tool call could not be used
    pub tool_name: Option<String>,
    pub messages: Vec<DisplayMessage>,
    pub actions: Vec<SubAction>,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub reasoning: String,
    /// Set when this decision replaced unusable LLM output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl Decision {
    /// `stay` plus a clarification request, confidence zero
    pub fn safe_default(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self {
            tool_name: None,
            messages: vec![DisplayMessage::new(SAFE_DEFAULT_MESSAGE)],
            actions: vec![SubAction::Stay],
            confidence: 0.0,
            reasoning: format!("safe default: {cause}"),
            degraded: Some(cause),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}
