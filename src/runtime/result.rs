//! What a turn hands back to the caller

use crate::flow::SwitchRejection;
use crate::state_machine::{DisplayMessage, TurnState};
use serde::Serialize;
use serde_json::{Map, Value};

/// An inbound user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: String,
    pub session_id: String,
    pub text: String,
    /// Delivery id used to drop duplicate deliveries
    pub message_id: Option<String>,
    pub tenant_id: Option<String>,
    pub channel_id: Option<String>,
    /// Flow for a brand new session; ignored once the session exists
    pub flow_id: Option<String>,
    pub is_admin: bool,
}

impl InboundMessage {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            text: text.into(),
            message_id: None,
            tenant_id: None,
            channel_id: None,
            flow_id: None,
            is_admin: false,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    #[must_use]
    pub fn with_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    #[must_use]
    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// One external action dispatched during the turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedAction {
    pub name: String,
    /// Node that triggered it, for Action nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Diagnostics attached to every turn
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnMetadata {
    pub sequence: u64,
    pub external_action_executed: bool,
    /// `None` when no external action ran
    pub external_action_successful: Option<bool>,
    pub tool_name: Option<String>,
    pub actions: Vec<ExecutedAction>,
    /// Nodes passed through without the LLM, in order
    pub auto_advanced: Vec<String>,
    pub llm_called: bool,
    /// Set when the turn fell back to the safe default
    pub degraded: Option<String>,
    pub rejected_updates: Vec<(String, String)>,
    pub rejected_switches: Vec<(String, SwitchRejection)>,
    pub kept_updates: Vec<String>,
    pub cleared_answers: Vec<String>,
    /// Set when the current question was skipped after too many attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_question: Option<String>,
}

impl TurnMetadata {
    pub fn record_action(&mut self, action: ExecutedAction) {
        self.external_action_executed = true;
        let ok = self.external_action_successful.unwrap_or(true) && action.success;
        self.external_action_successful = Some(ok);
        self.actions.push(action);
    }
}

/// Result of one processed turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub messages: Vec<DisplayMessage>,
    /// Message texts joined in order
    pub assistant_message: String,
    /// Model rationale for audit; empty on turns decided without the model
    pub reasoning: String,
    pub flow_id: String,
    pub current_node_id: String,
    pub state: TurnState,
    pub terminal: bool,
    pub escalate: bool,
    pub tool_name: Option<String>,
    pub confidence: f64,
    /// Answers changed by this turn; removed keys map to null
    pub updated_answers: Map<String, Value>,
    pub navigation: Option<String>,
    pub active_path: Option<String>,
    pub pending_field: Option<String>,
    pub metadata: TurnMetadata,
}

/// How a delivered message was handled
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDisposition {
    Completed(Box<TurnResult>),
    /// Same message id already processed or in flight; nothing changed
    Duplicate,
    /// A newer message for the session took over; nothing changed
    Superseded,
}

impl TurnDisposition {
    pub fn result(&self) -> Option<&TurnResult> {
        match self {
            TurnDisposition::Completed(result) => Some(result),
            TurnDisposition::Duplicate | TurnDisposition::Superseded => None,
        }
    }

    pub fn into_result(self) -> Option<TurnResult> {
        match self {
            TurnDisposition::Completed(result) => Some(*result),
            TurnDisposition::Duplicate | TurnDisposition::Superseded => None,
        }
    }
}
