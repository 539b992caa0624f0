//! Conversation state machine
//!
//! Pure functions from (context, decision) to a new context plus effects.
//! Nothing in here performs I/O.

pub mod action;
pub mod effect;
pub mod state;
pub mod transition;

#[cfg(test)]
mod proptests;

pub use action::{
    typing_delay_ms, Decision, DisplayMessage, SubAction, ADMIN_SUB_ACTIONS,
    SAFE_DEFAULT_MESSAGE, SUB_ACTION_NAMES,
};
pub use effect::{Effect, LocalEffect};
pub use state::TurnState;
pub use transition::{
    apply_sequence, effects_for, follow_edges, move_to, record_action_output,
    register_unproductive_turn, step, AppliedSequence, AttemptOutcome, Step, TransitionError,
};
