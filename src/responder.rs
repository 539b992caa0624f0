//! Responder: the LLM tool-calling bridge
//!
//! One call per turn. The model must answer with exactly one `perform_action`
//! tool call; anything else (no call, several calls, an unknown tool, input
//! that does not parse into known sub-actions) becomes the safe default
//! instead of an error.

pub mod prompt;

pub use prompt::{answer_summary, build_request, tool_definition, ActionListing, PromptLimits, TurnInput, TOOL_NAME};

use crate::llm::{LlmResponse, LlmService};
use crate::state_machine::{Decision, DisplayMessage, SubAction};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Confidence assumed when the model does not report one
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Why a model response could not be used
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionError {
    #[error("response contained no tool call")]
    NoToolCall,

    #[error("response contained {0} tool calls, expected exactly one")]
    MultipleToolCalls(usize),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool input must be an object")]
    InputNotObject,

    #[error("invalid messages: {0}")]
    InvalidMessages(String),

    #[error("invalid sub-action #{index}: {message}")]
    InvalidSubAction { index: usize, message: String },
}

/// Parse a model response into a decision.
///
/// Admin-only sub-actions are dropped on non-admin turns. An empty action list
/// means `stay`.
pub fn parse_decision(response: &LlmResponse, is_admin: bool) -> Result<Decision, DecisionError> {
    let calls = response.tool_uses();
    let (_, name, input) = match calls.as_slice() {
        [] => return Err(DecisionError::NoToolCall),
        [one] => *one,
        many => return Err(DecisionError::MultipleToolCalls(many.len())),
    };
    if name != TOOL_NAME {
        return Err(DecisionError::UnknownTool(name.to_string()));
    }
    let Value::Object(input) = input else {
        return Err(DecisionError::InputNotObject);
    };

    let messages = parse_messages(input.get("messages"))?;

    let raw_actions = match input.get("actions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DecisionError::InvalidSubAction {
                index: 0,
                message: "'actions' must be an array".to_string(),
            })
        }
    };
    let mut actions = Vec::with_capacity(raw_actions.len());
    for (index, raw) in raw_actions.into_iter().enumerate() {
        let action: SubAction =
            serde_json::from_value(raw).map_err(|e| DecisionError::InvalidSubAction {
                index,
                message: e.to_string(),
            })?;
        if action.is_admin_only() && !is_admin {
            tracing::info!(action = action.name(), "Dropped admin-only sub-action on non-admin turn");
            continue;
        }
        actions.push(action);
    }
    if actions.is_empty() {
        actions.push(SubAction::Stay);
    }

    let confidence = input
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map_or(DEFAULT_CONFIDENCE, |c| c.clamp(0.0, 1.0));

    let reasoning = input
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Decision {
        tool_name: Some(TOOL_NAME.to_string()),
        messages,
        actions,
        confidence,
        reasoning,
        degraded: None,
    })
}

/// Messages may be plain strings or `{text, delay_ms}` objects. Blank ones are
/// dropped.
fn parse_messages(raw: Option<&Value>) -> Result<Vec<DisplayMessage>, DecisionError> {
    let items = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(s)) => return Ok(non_blank(DisplayMessage::new(s.clone())).into_iter().collect()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(DecisionError::InvalidMessages("'messages' must be an array".to_string())),
    };

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let message = match item {
            Value::String(s) => DisplayMessage::new(s.clone()),
            Value::Object(_) => serde_json::from_value::<DisplayMessage>(item.clone())
                .map_err(|e| DecisionError::InvalidMessages(e.to_string()))?,
            other => return Err(DecisionError::InvalidMessages(format!("unexpected message {other}"))),
        };
        messages.extend(non_blank(message));
    }
    Ok(messages)
}

fn non_blank(message: DisplayMessage) -> Option<DisplayMessage> {
    (!message.text.trim().is_empty()).then_some(message)
}

/// Turns an LLM into one decision per turn
pub struct Responder<L> {
    llm: L,
    limits: PromptLimits,
    timeout: Duration,
}

impl<L: LlmService> Responder<L> {
    pub fn new(llm: L, limits: PromptLimits, timeout: Duration) -> Self {
        Self { llm, limits, timeout }
    }

    pub fn model_id(&self) -> &str {
        self.llm.model_id()
    }

    /// Ask the model for this turn's decision.
    ///
    /// Returns `None` only when `cancel` fires first; every other failure
    /// degrades to [`Decision::safe_default`].
    pub async fn decide(&self, input: &TurnInput<'_>, cancel: &CancellationToken) -> Option<Decision> {
        let request = build_request(input, &self.limits);
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = tokio::time::timeout(self.timeout, self.llm.complete(&request)) => result,
        };

        let decision = match result {
            Ok(Ok(response)) => match parse_decision(&response, input.is_admin) {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(
                        session_id = %input.context.session_id,
                        node = %input.context.current_node_id,
                        error = %e,
                        "Unusable tool call, using safe default"
                    );
                    Decision::safe_default(e.to_string())
                }
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    session_id = %input.context.session_id,
                    kind = %e.kind,
                    error = %e.message,
                    "LLM call failed, using safe default"
                );
                Decision::safe_default(format!("llm error: {e}"))
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %input.context.session_id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "LLM call timed out, using safe default"
                );
                Decision::safe_default("llm timeout")
            }
        };

        tracing::debug!(
            session_id = %input.context.session_id,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            actions = ?decision.actions.iter().map(SubAction::name).collect::<Vec<_>>(),
            confidence = decision.confidence,
            "Decision made"
        );
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ContentBlock;
    use crate::state_machine::SAFE_DEFAULT_MESSAGE;
    use serde_json::json;

    fn response(name: &str, input: Value) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::tool_use("t1", name, input)],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_decision() {
        let d = parse_decision(
            &response(
                TOOL_NAME,
                json!({
                    "messages": ["Nice to meet you!", {"text": "What's your email?", "delay_ms": 800}, "  "],
                    "actions": [
                        {"action": "update_answers", "updates": {"name": "Ana"}},
                        {"action": "navigate", "target": "ask_email"}
                    ],
                    "confidence": 0.9,
                    "reasoning": "name given"
                }),
            ),
            false,
        )
        .unwrap();
        assert_eq!(d.tool_name.as_deref(), Some(TOOL_NAME));
        assert_eq!(d.messages.len(), 2);
        assert_eq!(d.messages[1].delay_ms, Some(800));
        assert_eq!(d.actions.len(), 2);
        assert!((d.confidence - 0.9).abs() < f64::EPSILON);
        assert!(!d.is_degraded());
    }

    #[test]
    fn test_confidence_defaults_and_clamps() {
        let d = parse_decision(&response(TOOL_NAME, json!({"messages": [], "actions": []})), false).unwrap();
        assert!((d.confidence - DEFAULT_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(d.actions, vec![SubAction::Stay]);

        let d = parse_decision(&response(TOOL_NAME, json!({"actions": [], "confidence": 7})), false).unwrap();
        assert!((d.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_admin_actions_dropped_for_users() {
        let input = json!({
            "messages": ["ok"],
            "actions": [{"action": "update_communication_style", "style": "pirate"}]
        });
        let d = parse_decision(&response(TOOL_NAME, input.clone()), false).unwrap();
        assert_eq!(d.actions, vec![SubAction::Stay]);

        let d = parse_decision(&response(TOOL_NAME, input), true).unwrap();
        assert_eq!(d.actions[0].name(), "update_communication_style");
    }

    #[test]
    fn test_rejects_unusable_output() {
        assert_eq!(
            parse_decision(&response("launch_rockets", json!({})), false),
            Err(DecisionError::UnknownTool("launch_rockets".into()))
        );
        assert_eq!(
            parse_decision(&LlmResponse::default(), false),
            Err(DecisionError::NoToolCall)
        );
        assert!(matches!(
            parse_decision(&response(TOOL_NAME, json!({"actions": [{"action": "fly"}]})), false),
            Err(DecisionError::InvalidSubAction { index: 0, .. })
        ));
        assert_eq!(
            parse_decision(&response(TOOL_NAME, json!("stay")), false),
            Err(DecisionError::InputNotObject)
        );

        let mut two = response(TOOL_NAME, json!({}));
        two.content.push(ContentBlock::tool_use("t2", TOOL_NAME, json!({})));
        assert_eq!(parse_decision(&two, false), Err(DecisionError::MultipleToolCalls(2)));
    }

    #[test]
    fn test_safe_default_shape() {
        let err = parse_decision(&response("nope", json!({})), false).unwrap_err();
        let d = Decision::safe_default(err.to_string());
        assert_eq!(d.tool_name, None);
        assert_eq!(d.actions, vec![SubAction::Stay]);
        assert_eq!(d.messages[0].text, SAFE_DEFAULT_MESSAGE);
        assert!(d.confidence.abs() < f64::EPSILON);
    }
}
