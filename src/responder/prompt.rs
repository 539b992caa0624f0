//! Per-turn instruction building
//!
//! The system prompt has two parts: a stable rule block (cached by the
//! provider) and a state block describing where the conversation is. The
//! user's message goes in as the only conversational message.

use crate::context::{FlowContext, Role};
use crate::flow::{CompiledFlow, Node, NodeKind, PathSelector};
use crate::llm::{LlmMessage, LlmRequest, SystemContent, ToolDefinition};
use crate::state_machine::{ADMIN_SUB_ACTIONS, SUB_ACTION_NAMES};
use serde_json::{json, Map, Value};
use std::fmt::Write;

/// Name of the single tool the model must call
pub const TOOL_NAME: &str = "perform_action";

const BASE_PROMPT: &str = r"You drive a structured conversation. Each turn you read the conversation state and the user's latest message, then call the perform_action tool exactly once.

perform_action carries:
- messages: what to say to the user, in order. Keep each message short and natural.
- actions: an ordered list of steps applied to the conversation state.
- confidence: 0.0 to 1.0, how sure you are about the actions.
- reasoning: one sentence for the operators; never shown to the user.

Available actions:
- stay: remain on the current step (ask again, clarify, answer a side question).
- navigate {target}: move along one of the listed transitions, into one of the listed paths, or back to an earlier question the user wants to change.
- update_answers {updates}: record information the user gave. Existing answers are never overwritten by this action.
- correct_answer {key, value}: replace an existing answer the user explicitly corrected.
- switch_path {path, reason}: the user clearly belongs on a different path than the active one.
- request_human_handoff {reason}: the user asks for a person or you cannot help.
- confirm_completion: everything needed has been collected and confirmed.
- restart_conversation {keep_answers}: the user wants to start over.
- execute_action {name, parameters}: run one of the listed external actions.

Rules:
- Record every answer the user gives, even for questions not yet asked.
- Never invent answers the user did not give.
- Only navigate to targets listed in the state.
- If unsure, stay and ask a clarifying question.";

const ADMIN_PROMPT: &str = r"
This turn comes from an administrator. Two more actions are available:
- modify_flow {instruction}: change the conversation flow itself.
- update_communication_style {style}: change how you talk to users from now on.";

/// Bounds on how much state goes into one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub history_turns: usize,
    pub answer_entries: usize,
    pub answer_value_chars: usize,
    pub max_tokens: u32,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            history_turns: 10,
            answer_entries: 40,
            answer_value_chars: 200,
            max_tokens: 1024,
        }
    }
}

/// An external action the model may call, as listed in the prompt
#[derive(Debug, Clone, PartialEq)]
pub struct ActionListing {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything the Responder needs to know about one turn
#[derive(Debug, Clone, Copy)]
pub struct TurnInput<'a> {
    pub context: &'a FlowContext,
    pub root: &'a CompiledFlow,
    pub message: &'a str,
    pub is_admin: bool,
    pub actions: &'a [ActionListing],
}

/// Build the single request sent for a turn
pub fn build_request(input: &TurnInput<'_>, limits: &PromptLimits) -> LlmRequest {
    let mut rules = BASE_PROMPT.to_string();
    if input.is_admin {
        rules.push_str(ADMIN_PROMPT);
    }

    LlmRequest {
        system: vec![
            SystemContent::cached(rules),
            SystemContent::new(state_block(input, limits)),
        ],
        messages: vec![LlmMessage::user(if input.message.trim().is_empty() {
            "(no text)"
        } else {
            input.message
        })],
        tools: vec![tool_definition(input.is_admin)],
        tool_choice: Some(TOOL_NAME.to_string()),
        max_tokens: Some(limits.max_tokens),
    }
}

/// The `perform_action` tool. Admin-only sub-actions are only advertised on
/// admin turns.
pub fn tool_definition(is_admin: bool) -> ToolDefinition {
    let names: Vec<&str> = SUB_ACTION_NAMES
        .iter()
        .copied()
        .filter(|n| is_admin || !ADMIN_SUB_ACTIONS.contains(n))
        .collect();

    ToolDefinition {
        name: TOOL_NAME.to_string(),
        description: "Reply to the user and update the conversation state. Call exactly once per turn."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "messages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string"},
                            "delay_ms": {"type": "integer", "minimum": 0}
                        },
                        "required": ["text"]
                    }
                },
                "actions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "action": {"type": "string", "enum": names},
                            "target": {"type": "string"},
                            "updates": {"type": "object"},
                            "key": {"type": "string"},
                            "value": {},
                            "path": {"type": "string"},
                            "reason": {"type": "string"},
                            "keep_answers": {"type": "boolean"},
                            "name": {"type": "string"},
                            "parameters": {"type": "object"},
                            "instruction": {"type": "string"},
                            "style": {"type": "string"}
                        },
                        "required": ["action"]
                    }
                },
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "reasoning": {"type": "string"}
            },
            "required": ["messages", "actions"]
        }),
    }
}

fn state_block(input: &TurnInput<'_>, limits: &PromptLimits) -> String {
    let ctx = input.context;
    let graph = ctx.active_graph(input.root).unwrap_or(input.root);
    let node = graph.node(&ctx.current_node_id);

    let mut out = String::new();
    let _ = writeln!(out, "# Conversation state");
    let _ = writeln!(out, "Flow: {}", ctx.flow_id);
    if !ctx.frames.is_empty() {
        let _ = writeln!(out, "Inside subflow: {}", ctx.frames.iter().map(|f| f.flow_ref.as_str()).collect::<Vec<_>>().join(" > "));
    }

    match node {
        Some(node) => write_current_node(&mut out, ctx, node),
        None => {
            let _ = writeln!(out, "Current step: {} (unknown)", ctx.current_node_id);
        }
    }

    if let Some(style) = &ctx.communication_style {
        let _ = writeln!(out, "\nCommunication style: {style}");
    }

    let _ = writeln!(out, "\n## Answers so far");
    let summary = answer_summary(&ctx.answers, limits.answer_entries, limits.answer_value_chars);
    if summary.is_empty() {
        let _ = writeln!(out, "(none)");
    } else {
        out.push_str(&summary);
    }

    if let Some(node) = node {
        write_transitions(&mut out, ctx, graph, node);
    }

    let revisitable: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.revisitable && n.id != ctx.current_node_id)
        .filter_map(|n| n.as_question().map(|q| format!("{} ({})", n.id, q.key)))
        .collect();
    if !revisitable.is_empty() {
        let _ = writeln!(out, "\n## Earlier questions that can be revisited");
        let _ = writeln!(out, "{}", revisitable.join(", "));
    }

    if !input.actions.is_empty() {
        let _ = writeln!(out, "\n## External actions");
        for action in input.actions {
            let _ = writeln!(out, "- {}: {} parameters={}", action.name, action.description, action.parameters);
        }
    }

    let history: Vec<_> = ctx.recent_history(limits.history_turns).collect();
    if !history.is_empty() {
        let _ = writeln!(out, "\n## Recent messages");
        for entry in history {
            let who = match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            let _ = writeln!(out, "{who}: {}", truncate_chars(&entry.text, limits.answer_value_chars * 2));
        }
    }

    let _ = writeln!(out, "\nAdministrator turn: {}", if input.is_admin { "yes" } else { "no" });
    out
}

fn write_current_node(out: &mut String, ctx: &FlowContext, node: &Node) {
    let _ = writeln!(out, "Current step: {} ({}, {})", node.id, node.kind_name(), node.display_name());
    if let Some(prompt) = node.prompt() {
        let _ = writeln!(out, "Prompt: {prompt}");
    }
    if let NodeKind::Question(q) = &node.kind {
        let _ = writeln!(out, "Collects answer key: {} (type {:?})", q.key, q.data_type);
        if !q.allowed_values.is_empty() {
            let _ = writeln!(out, "Allowed values: {}", q.allowed_values.join(", "));
        }
        if let Some(attempts) = ctx.attempts.get(&node.id) {
            let _ = writeln!(out, "Attempts so far: {attempts} of {}", node.max_attempts);
        }
    }
    if let Some(pending) = &ctx.pending_field {
        let _ = writeln!(out, "Waiting for: {pending}");
    }
}

fn write_transitions(out: &mut String, ctx: &FlowContext, graph: &CompiledFlow, node: &Node) {
    let edges = graph.outgoing(&node.id);
    if !edges.is_empty() {
        let _ = writeln!(out, "\n## Possible transitions");
        for edge in edges {
            let target = graph.resolve(&edge.target).map_or(edge.target.as_str(), |(_, n)| n.display_name());
            let _ = write!(out, "- target={}", edge.target);
            if !edge.label.is_empty() {
                let _ = write!(out, " label=\"{}\"", edge.label);
            }
            let _ = write!(out, " ({target})");
            if !edge.condition_description.is_empty() {
                let _ = write!(out, " when: {}", edge.condition_description);
            }
            let _ = writeln!(out);
        }
    }

    let owner = ctx.path.path_owner.as_deref().and_then(|id| graph.node(id));
    let paths = owner.map_or_else(|| node.paths(), Node::paths);
    if !paths.is_empty() {
        let _ = writeln!(out, "\n## Paths");
        let active = ctx
            .path
            .active_path
            .as_deref()
            .and_then(|name| PathSelector::find(paths, name));
        for def in paths {
            let marker = if active.is_some_and(|a| a.name == def.name) { " [active]" } else { "" };
            let _ = writeln!(out, "- {} ({}){marker}", def.name, def.display_name());
        }
        if PathSelector::is_locked(&ctx.path, active) {
            let _ = writeln!(out, "The active path is locked; switching is not possible.");
        }
    }
}

/// One `key: value` line per answer, bounded in count and value length
pub fn answer_summary(answers: &Map<String, Value>, max_entries: usize, max_chars: usize) -> String {
    let mut out = String::new();
    for (key, value) in answers.iter().take(max_entries) {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "- {key}: {}", truncate_chars(&text, max_chars));
    }
    if answers.len() > max_entries {
        let _ = writeln!(out, "- ... {} more", answers.len() - max_entries);
    }
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
