//! Turn lifecycle state

use serde::{Deserialize, Serialize};

/// Where a conversation stands between turns
///
/// `AwaitingInput -> Deciding -> {AwaitingInput | Terminal | Escalated}`.
/// `Terminal` and `Escalated` are absorbing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnState {
    /// Waiting for the next user message
    #[default]
    AwaitingInput,

    /// A turn is being processed
    Deciding,

    /// A Terminal node was reached
    Terminal { reason: String, success: bool },

    /// Handed off to a human operator
    Escalated { reason: String },
}

impl TurnState {
    /// No ordinary turn can leave this state
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TurnState::Terminal { .. } | TurnState::Escalated { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Terminal { .. })
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, TurnState::Escalated { .. })
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TurnState::AwaitingInput => "awaiting_input",
            TurnState::Deciding => "deciding",
            TurnState::Terminal { .. } => "terminal",
            TurnState::Escalated { .. } => "escalated",
        }
    }
}
