//! Pure state transitions
//!
//! Two entry points, both free of I/O:
//!
//! - [`apply_sequence`] maps the Responder's sub-actions to effects and applies
//!   them atomically to a copy of the context.
//! - [`step`] performs one deterministic auto-advance step from the current node.
//!
//! External effects are only collected here; the runner dispatches them.

use super::action::SubAction;
use super::effect::{Effect, LocalEffect};
use super::state::TurnState;
use crate::context::{apply_updates, correct_answer, FlowContext, SubflowFrame};
use crate::flow::{
    is_filled, select_edge, split_qualified, ActionNode, CompiledFlow, DecisionType, EdgeChoice,
    GuardEvaluator, GuardScope, Node, NodeKind, PathDefinition, PathSelector, SwitchRejection,
    SwitchVerdict, TerminalNode,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Hard validation failures. Any of these rolls back the whole sequence.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Current node '{0}' does not exist in the active graph")]
    CurrentNodeMissing(String),

    #[error("Subflow frame '{0}' does not resolve")]
    BrokenFrame(String),

    #[error("Nothing named '{target}' is reachable from node '{node}'")]
    UnknownTarget { node: String, target: String },

    #[error("Node '{node}' declares no path named '{path}'")]
    UnknownPath { node: String, path: String },

    #[error("Node '{0}' is not a path-selection point")]
    NoPaths(String),

    #[error("Answer key '{0}' is not known to this flow")]
    UnknownAnswerKey(String),

    #[error("Question '{0}' cannot be revisited")]
    NotRevisitable(String),
}

fn active_graph<'f>(
    ctx: &FlowContext,
    root: &'f CompiledFlow,
) -> Result<&'f CompiledFlow, TransitionError> {
    ctx.active_graph(root).ok_or_else(|| {
        TransitionError::BrokenFrame(
            ctx.frames
                .last()
                .map(|f| f.flow_ref.clone())
                .unwrap_or_default(),
        )
    })
}

fn current_node<'f>(
    ctx: &FlowContext,
    graph: &'f CompiledFlow,
) -> Result<&'f Node, TransitionError> {
    graph
        .node(&ctx.current_node_id)
        .ok_or_else(|| TransitionError::CurrentNodeMissing(ctx.current_node_id.clone()))
}

// ============================================================================
// Tool Execution Service: sub-action -> effects
// ============================================================================

/// Map one sub-action to the effects it produces against `ctx`.
///
/// Admin-only sub-actions on non-admin turns produce nothing.
pub fn effects_for(
    action: &SubAction,
    ctx: &FlowContext,
    root: &CompiledFlow,
    is_admin: bool,
) -> Result<Vec<Effect>, TransitionError> {
    if action.is_admin_only() && !is_admin {
        tracing::debug!(action = action.name(), "Dropping admin-only sub-action");
        return Ok(vec![]);
    }

    let graph = active_graph(ctx, root)?;

    match action {
        SubAction::Stay => Ok(vec![]),

        SubAction::Navigate { target } => {
            let node = current_node(ctx, graph)?;
            resolve_navigation(ctx, graph, node, target, is_admin)
        }

        SubAction::UpdateAnswers { updates } => Ok(vec![Effect::local(LocalEffect::MergeAnswers {
            updates: updates.clone(),
        })]),

        SubAction::CorrectAnswer { key, value } => {
            check_correctable(ctx, graph, root, key)?;
            Ok(vec![Effect::local(LocalEffect::CorrectAnswer {
                key: key.clone(),
                value: value.clone(),
            })])
        }

        SubAction::SwitchPath { path, force, .. } => {
            let owner_id = ctx
                .path
                .path_owner
                .clone()
                .unwrap_or_else(|| ctx.current_node_id.clone());
            let owner = find_path_owner(graph, root, &owner_id)?;
            let def = PathSelector::find(owner.paths(), path).ok_or_else(|| {
                TransitionError::UnknownPath {
                    node: owner.id.clone(),
                    path: path.clone(),
                }
            })?;
            Ok(switch_effects(ctx, owner, def, *force, is_admin))
        }

        SubAction::RequestHumanHandoff { reason } => {
            let reason = if reason.trim().is_empty() {
                "human handoff requested".to_string()
            } else {
                reason.clone()
            };
            Ok(vec![Effect::local(LocalEffect::Escalate { reason })])
        }

        SubAction::ConfirmCompletion => {
            // Prefer a terminal the flow declares; it may chain or hand off
            let to_terminal = graph
                .outgoing(&ctx.current_node_id)
                .iter()
                .find(|e| graph.resolve(&e.target).is_some_and(|(_, n)| n.is_terminal()));
            Ok(vec![match to_terminal {
                Some(edge) => Effect::move_to(&edge.target),
                None => Effect::local(LocalEffect::Finish {
                    reason: "completed".to_string(),
                    success: true,
                }),
            }])
        }

        SubAction::RestartConversation { keep_answers } => {
            Ok(vec![Effect::local(LocalEffect::Restart {
                keep_answers: *keep_answers,
            })])
        }

        SubAction::ExecuteAction { name, parameters } => {
            Ok(vec![Effect::external(name, parameters.clone())])
        }

        SubAction::ModifyFlow { instruction } => {
            let mut parameters = Map::new();
            parameters.insert("instruction".to_string(), json!(instruction));
            parameters.insert("flow_id".to_string(), json!(ctx.flow_id));
            Ok(vec![Effect::external("modify_flow", parameters)])
        }

        SubAction::UpdateCommunicationStyle { style } => {
            Ok(vec![Effect::local(LocalEffect::SetCommunicationStyle {
                style: style.clone(),
            })])
        }
    }
}

/// Navigation resolves, in order: edge targets, edge labels, path names and
/// labels, then revisitable questions of the active graph.
fn resolve_navigation(
    ctx: &FlowContext,
    graph: &CompiledFlow,
    node: &Node,
    target: &str,
    is_admin: bool,
) -> Result<Vec<Effect>, TransitionError> {
    let wanted = target.trim();
    let edges = graph.outgoing(&node.id);

    if let Some(edge) = edges.iter().find(|e| e.target == wanted) {
        return Ok(vec![Effect::move_to(&edge.target)]);
    }
    if let Some(edge) = edges
        .iter()
        .find(|e| !e.label.is_empty() && e.label.eq_ignore_ascii_case(wanted))
    {
        return Ok(vec![Effect::move_to(&edge.target)]);
    }
    if let Some(def) = PathSelector::find(node.paths(), wanted) {
        return Ok(switch_effects(ctx, node, def, false, is_admin));
    }
    if let Some(revisit) = graph.node(wanted) {
        if let Some(q) = revisit.as_question() {
            if !revisit.revisitable {
                return Err(TransitionError::NotRevisitable(revisit.id.clone()));
            }
            return Ok(vec![Effect::local(LocalEffect::Revisit {
                target: revisit.id.clone(),
                key: q.key.clone(),
            })]);
        }
    }

    Err(TransitionError::UnknownTarget {
        node: node.id.clone(),
        target: target.to_string(),
    })
}

fn switch_effects(
    ctx: &FlowContext,
    owner: &Node,
    def: &PathDefinition,
    force: bool,
    is_admin: bool,
) -> Vec<Effect> {
    match PathSelector::evaluate_switch(&ctx.path, owner.paths(), def, force, is_admin) {
        SwitchVerdict::Allowed(path) => vec![
            Effect::local(LocalEffect::ActivatePath {
                owner: owner.id.clone(),
                path: path.name.clone(),
            }),
            Effect::move_to(&path.target),
        ],
        SwitchVerdict::Unchanged => vec![],
        SwitchVerdict::Rejected(reason) => vec![Effect::local(LocalEffect::PathSwitchRejected {
            path: def.name.clone(),
            reason,
        })],
    }
}

fn find_path_owner<'f>(
    graph: &'f CompiledFlow,
    root: &'f CompiledFlow,
    owner_id: &str,
) -> Result<&'f Node, TransitionError> {
    let owner = graph
        .node(owner_id)
        .or_else(|| root.node(owner_id))
        .ok_or_else(|| TransitionError::CurrentNodeMissing(owner_id.to_string()))?;
    if owner.paths().is_empty() {
        return Err(TransitionError::NoPaths(owner.id.clone()));
    }
    Ok(owner)
}

/// Corrections target a known key; answered non-revisitable questions are frozen
fn check_correctable(
    ctx: &FlowContext,
    graph: &CompiledFlow,
    root: &CompiledFlow,
    key: &str,
) -> Result<(), TransitionError> {
    let owner = graph
        .nodes
        .values()
        .chain(root.nodes.values())
        .find(|n| n.as_question().is_some_and(|q| q.key == key));

    if let Some(node) = owner {
        if !node.revisitable && ctx.answers.get(key).is_some_and(is_filled) {
            return Err(TransitionError::NotRevisitable(node.id.clone()));
        }
        return Ok(());
    }

    let in_path = graph
        .nodes
        .values()
        .flat_map(|n| n.paths())
        .any(|p| p.answer_keys.iter().any(|k| k == key));
    if ctx.answers.contains_key(key) || in_path {
        Ok(())
    } else {
        Err(TransitionError::UnknownAnswerKey(key.to_string()))
    }
}

// ============================================================================
// Atomic application
// ============================================================================

/// The context after a successfully applied sequence, plus what happened
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedSequence {
    pub context: FlowContext,
    /// Every effect, in application order
    pub effects: Vec<Effect>,
    pub applied_updates: Vec<String>,
    /// Updates ignored because the key already held a value
    pub kept_updates: Vec<String>,
    /// Last node moved to, if any
    pub navigation: Option<String>,
    /// Path-scoped answers cleared by a path switch
    pub cleared_answers: Vec<String>,
    pub rejected_switches: Vec<(String, SwitchRejection)>,
    /// Proposed answers that failed validation, with the reason
    pub rejected_updates: Vec<(String, String)>,
}

impl AppliedSequence {
    fn start(ctx: &FlowContext) -> Self {
        Self {
            context: ctx.clone(),
            effects: Vec::new(),
            applied_updates: Vec::new(),
            kept_updates: Vec::new(),
            navigation: None,
            cleared_answers: Vec::new(),
            rejected_switches: Vec::new(),
            rejected_updates: Vec::new(),
        }
    }

    /// External calls to dispatch, in order
    pub fn external_calls(&self) -> impl Iterator<Item = (&str, &Map<String, Value>)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::External { action, parameters } => Some((action.as_str(), parameters)),
            Effect::Local(_) => None,
        })
    }
}

/// Apply an ordered sub-action list to a copy of `ctx`.
///
/// Either every sub-action commits or, on the first hard failure, none does
/// and `ctx` is untouched. Once the conversation becomes terminal or
/// escalated, the remaining sub-actions are ignored except a restart.
pub fn apply_sequence(
    ctx: &FlowContext,
    root: &CompiledFlow,
    actions: &[SubAction],
    is_admin: bool,
) -> Result<AppliedSequence, TransitionError> {
    let mut applied = AppliedSequence::start(ctx);

    for action in actions {
        if applied.context.state.is_absorbing()
            && !matches!(action, SubAction::RestartConversation { .. })
        {
            continue;
        }
        let effects = effects_for(action, &applied.context, root, is_admin)?;
        for effect in effects {
            if let Effect::Local(local) = &effect {
                apply_local(&mut applied, root, local)?;
            }
            applied.effects.push(effect);
        }
    }

    Ok(applied)
}

fn apply_local(
    applied: &mut AppliedSequence,
    root: &CompiledFlow,
    effect: &LocalEffect,
) -> Result<(), TransitionError> {
    let ctx = &mut applied.context;
    match effect {
        LocalEffect::MergeAnswers { updates } => {
            let graph = active_graph(ctx, root)?;
            let mut accepted = Map::new();
            for (key, value) in updates {
                match normalize_answer(graph, root, key, value) {
                    Ok(value) => {
                        accepted.insert(key.clone(), value);
                    }
                    Err(reason) => applied.rejected_updates.push((key.clone(), reason)),
                }
            }
            let outcome = apply_updates(&mut ctx.answers, &accepted, &mut ctx.pending_field);
            applied.applied_updates.extend(outcome.applied);
            applied.kept_updates.extend(outcome.kept);
        }
        LocalEffect::CorrectAnswer { key, value } => {
            let graph = active_graph(ctx, root)?;
            match normalize_answer(graph, root, key, value) {
                Ok(value) => {
                    correct_answer(&mut ctx.answers, key, value, &mut ctx.pending_field);
                    if !applied.applied_updates.contains(key) {
                        applied.applied_updates.push(key.clone());
                    }
                }
                Err(reason) => applied.rejected_updates.push((key.clone(), reason)),
            }
        }
        LocalEffect::MoveTo { target } => {
            move_to(ctx, root, target)?;
            applied.navigation = Some(ctx.current_node_id.clone());
        }
        LocalEffect::Revisit { target, key } => {
            move_to(ctx, root, target)?;
            ctx.pending_field = Some(key.clone());
            applied.navigation = Some(ctx.current_node_id.clone());
        }
        LocalEffect::ActivatePath { owner, path } => {
            let graph = active_graph(ctx, root)?;
            let owner_node = find_path_owner(graph, root, owner)?;
            let def = PathSelector::find(owner_node.paths(), path).ok_or_else(|| {
                TransitionError::UnknownPath {
                    node: owner.clone(),
                    path: path.clone(),
                }
            })?;
            let cleared = PathSelector::activate(
                &mut ctx.path,
                &mut ctx.answers,
                owner_node.paths(),
                owner,
                def,
            );
            applied.cleared_answers.extend(cleared);
        }
        LocalEffect::PathSwitchRejected { path, reason } => {
            applied.rejected_switches.push((path.clone(), *reason));
        }
        LocalEffect::Escalate { reason } => {
            ctx.state = TurnState::Escalated {
                reason: reason.clone(),
            };
        }
        LocalEffect::Finish { reason, success } => {
            ctx.state = TurnState::Terminal {
                reason: reason.clone(),
                success: *success,
            };
        }
        LocalEffect::Restart { keep_answers } => {
            ctx.restart(root, *keep_answers);
            applied.navigation = Some(ctx.current_node_id.clone());
        }
        LocalEffect::SetCommunicationStyle { style } => {
            let style = style.trim();
            ctx.communication_style = (!style.is_empty()).then(|| style.to_string());
        }
    }
    Ok(())
}

/// Validate a proposed answer against the question that owns `key`, if any.
/// Empty values pass through untouched; the merge ignores them anyway.
fn normalize_answer(
    graph: &CompiledFlow,
    root: &CompiledFlow,
    key: &str,
    value: &Value,
) -> Result<Value, String> {
    if !is_filled(value) {
        return Ok(value.clone());
    }
    let question = graph
        .nodes
        .values()
        .chain(root.nodes.values())
        .find_map(|n| n.as_question().filter(|q| q.key == key));
    match question {
        Some(q) => q.normalize(value),
        None => Ok(value.clone()),
    }
}

/// Move to a local id or a qualified `flow_ref/node_id` reference in the
/// active graph. Qualified references push subflow frames.
pub fn move_to(
    ctx: &mut FlowContext,
    root: &CompiledFlow,
    reference: &str,
) -> Result<(), TransitionError> {
    let graph = active_graph(ctx, root)?;
    if graph.node(reference).is_some() {
        enter(ctx, root, reference);
        return Ok(());
    }

    let unknown = || TransitionError::UnknownTarget {
        node: ctx.current_node_id.clone(),
        target: reference.to_string(),
    };
    let (flow_ref, rest) = split_qualified(reference).ok_or_else(unknown)?;
    let sub = graph.subflow(flow_ref).ok_or_else(unknown)?;
    if sub.resolve(rest).is_none() {
        return Err(unknown());
    }

    let carrier = graph.nodes.values().find_map(|n| match &n.kind {
        NodeKind::Subflow(s) if s.flow_ref == flow_ref => Some((n.id.clone(), s)),
        _ => None,
    });
    let return_node = carrier
        .as_ref()
        .map_or_else(|| ctx.current_node_id.clone(), |(id, _)| id.clone());
    if let Some((_, s)) = carrier {
        copy_mapping(&mut ctx.answers, &s.input_mapping);
    }
    ctx.frames.push(SubflowFrame {
        flow_ref: flow_ref.to_string(),
        return_node,
    });
    move_to(ctx, root, rest)
}

fn enter(ctx: &mut FlowContext, root: &CompiledFlow, node_id: &str) {
    ctx.current_node_id = node_id.to_string();
    ctx.attempts.remove(node_id);
    ctx.sync_pending_field(root);
}

/// Copy answers along a `destination -> source` key mapping. Empty sources
/// are not copied.
fn copy_mapping(answers: &mut Map<String, Value>, mapping: &Map<String, Value>) {
    for (destination, source) in mapping {
        let Some(source) = source.as_str() else {
            continue;
        };
        if let Some(value) = answers.get(source).filter(|v| is_filled(v)).cloned() {
            answers.insert(destination.clone(), value);
        }
    }
}

// ============================================================================
// Deterministic auto-advance
// ============================================================================

/// Outcome of one auto-advance step
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Moved without the LLM; keep stepping
    Moved { from: String, to: String },
    /// Needs user input or a Responder decision
    Wait,
    /// The runner must execute this Action node, then call [`follow_edges`]
    RunAction { node_id: String, action: ActionNode },
    /// A Terminal was reached; the context is now terminal
    Finished { reason: String, success: bool },
    /// The context is now escalated
    Escalated { reason: String },
    /// A Terminal asks to continue in another flow
    ChainFlow { flow_id: String, reason: String },
}

enum Choice {
    Advance(String),
    Ambiguous,
    Blocked,
    NoEdges,
}

fn choose(
    ctx: &FlowContext,
    graph: &CompiledFlow,
    evaluator: &GuardEvaluator,
    text: &str,
) -> Choice {
    let edges = graph.outgoing(&ctx.current_node_id);
    if edges.is_empty() {
        return Choice::NoEdges;
    }
    let scope = GuardScope::new(&ctx.answers, text);
    match select_edge(evaluator, edges, &scope) {
        EdgeChoice::Advance(edge) => Choice::Advance(edge.target.clone()),
        EdgeChoice::Ambiguous(_) => Choice::Ambiguous,
        EdgeChoice::Blocked => Choice::Blocked,
    }
}

fn escalate(ctx: &mut FlowContext, reason: String) -> Step {
    ctx.state = TurnState::Escalated {
        reason: reason.clone(),
    };
    Step::Escalated { reason }
}

fn moved(
    ctx: &mut FlowContext,
    root: &CompiledFlow,
    target: &str,
) -> Result<Step, TransitionError> {
    let from = ctx.current_node_id.clone();
    move_to(ctx, root, target)?;
    Ok(Step::Moved {
        from,
        to: ctx.current_node_id.clone(),
    })
}

/// One deterministic step from the current node.
///
/// `text` is what keyword guards look at, normally the user's message.
pub fn step(
    ctx: &mut FlowContext,
    root: &CompiledFlow,
    evaluator: &GuardEvaluator,
    text: &str,
) -> Result<Step, TransitionError> {
    if ctx.state.is_absorbing() {
        return Ok(Step::Wait);
    }
    let graph = active_graph(ctx, root)?;
    let node = current_node(ctx, graph)?;

    match &node.kind {
        NodeKind::Question(q) => {
            let skipped = ctx.skipped.contains(&node.id);
            let waiting = !skipped
                && (ctx.pending_field.as_deref() == Some(q.key.as_str())
                    || !ctx.answers.get(&q.key).is_some_and(is_filled));
            if waiting {
                return Ok(Step::Wait);
            }
            match choose(ctx, graph, evaluator, text) {
                Choice::Advance(target) => moved(ctx, root, &target),
                // A skipped question takes its first edge regardless of guards
                Choice::Blocked | Choice::Ambiguous if skipped => {
                    let target = graph.outgoing(&node.id)[0].target.clone();
                    moved(ctx, root, &target)
                }
                Choice::Blocked | Choice::Ambiguous => Ok(Step::Wait),
                Choice::NoEdges => Ok(escalate(
                    ctx,
                    format!("question '{}' has no way forward", node.id),
                )),
            }
        }

        NodeKind::Decision(d) => {
            if d.decision_type == DecisionType::LlmAssisted {
                return Ok(Step::Wait);
            }
            if !d.paths.is_empty() && ctx.path.path_owner.as_deref() != Some(node.id.as_str()) {
                let scope = GuardScope::new(&ctx.answers, text);
                if let Some(def) = PathSelector::select_entry(&d.paths, evaluator, &scope) {
                    let target = def.target.clone();
                    PathSelector::activate(&mut ctx.path, &mut ctx.answers, &d.paths, &node.id, def);
                    return moved(ctx, root, &target);
                }
            }
            match choose(ctx, graph, evaluator, text) {
                Choice::Advance(target) => moved(ctx, root, &target),
                Choice::Blocked | Choice::Ambiguous => Ok(Step::Wait),
                Choice::NoEdges if !d.paths.is_empty() => Ok(Step::Wait),
                Choice::NoEdges => Ok(escalate(
                    ctx,
                    format!("decision '{}' has no way forward", node.id),
                )),
            }
        }

        NodeKind::Terminal(t) => reach_terminal(ctx, root, evaluator, text, &node.id, t),

        NodeKind::Action(a) => Ok(Step::RunAction {
            node_id: node.id.clone(),
            action: a.clone(),
        }),

        NodeKind::Subflow(s) => {
            let sub = graph
                .subflow(&s.flow_ref)
                .ok_or_else(|| TransitionError::BrokenFrame(s.flow_ref.clone()))?;
            copy_mapping(&mut ctx.answers, &s.input_mapping);
            ctx.frames.push(SubflowFrame {
                flow_ref: s.flow_ref.clone(),
                return_node: node.id.clone(),
            });
            let from = node.id.clone();
            enter(ctx, root, &sub.entry);
            Ok(Step::Moved {
                from,
                to: ctx.current_node_id.clone(),
            })
        }
    }
}

fn reach_terminal(
    ctx: &mut FlowContext,
    root: &CompiledFlow,
    evaluator: &GuardEvaluator,
    text: &str,
    node_id: &str,
    terminal: &TerminalNode,
) -> Result<Step, TransitionError> {
    let reason = if terminal.reason.is_empty() {
        node_id.to_string()
    } else {
        terminal.reason.clone()
    };

    // A successful end of a subflow resumes the parent after the Subflow node
    if terminal.success && !terminal.handoff_required {
        if let Some(frame) = ctx.frames.pop() {
            let parent = active_graph(ctx, root)?;
            if let Some(NodeKind::Subflow(s)) = parent.node(&frame.return_node).map(|n| &n.kind) {
                copy_mapping(&mut ctx.answers, &s.output_mapping);
            }
            ctx.current_node_id = frame.return_node;
            return follow_edges(ctx, root, evaluator, text);
        }
    }

    if terminal.handoff_required {
        return Ok(escalate(ctx, reason));
    }
    if let Some(flow_id) = &terminal.next_flow {
        return Ok(Step::ChainFlow {
            flow_id: flow_id.clone(),
            reason,
        });
    }
    ctx.state = TurnState::Terminal {
        reason: reason.clone(),
        success: terminal.success,
    };
    Ok(Step::Finished {
        reason,
        success: terminal.success,
    })
}

/// Leave a non-conversational node (finished Action, returned Subflow) along
/// its first satisfied edge. Without one there is nobody to ask, so the
/// conversation escalates.
pub fn follow_edges(
    ctx: &mut FlowContext,
    root: &CompiledFlow,
    evaluator: &GuardEvaluator,
    text: &str,
) -> Result<Step, TransitionError> {
    let graph = active_graph(ctx, root)?;
    match choose(ctx, graph, evaluator, text) {
        Choice::Advance(target) => moved(ctx, root, &target),
        Choice::Ambiguous => Ok(escalate(
            ctx,
            format!("ambiguous edges out of '{}'", ctx.current_node_id),
        )),
        Choice::Blocked | Choice::NoEdges => Ok(escalate(
            ctx,
            format!("no satisfiable edge out of '{}'", ctx.current_node_id),
        )),
    }
}

/// Store the declared `output_keys` of an action result into answers.
///
/// Action outputs are authoritative and overwrite existing values.
pub fn record_action_output(
    ctx: &mut FlowContext,
    output_keys: &[String],
    data: &Map<String, Value>,
) -> Vec<String> {
    let mut stored = Vec::new();
    for key in output_keys {
        if let Some(value) = data.get(key) {
            ctx.answers.insert(key.clone(), value.clone());
            stored.push(key.clone());
        }
    }
    if let Some(pending) = ctx.pending_field.as_deref() {
        if stored.iter().any(|k| k == pending) {
            ctx.pending_field = None;
        }
    }
    stored
}

// ============================================================================
// Attempts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Not a question turn, or the pending field got filled
    NotCounted,
    Counted(u32),
    /// Attempts exhausted on a skippable question; it was skipped
    Skipped(String),
    /// Attempts exhausted on a required question; the context is escalated
    Exhausted(String),
}

/// Count a turn that left the current question unanswered
pub fn register_unproductive_turn(ctx: &mut FlowContext, root: &CompiledFlow) -> AttemptOutcome {
    let Ok(graph) = active_graph(ctx, root) else {
        return AttemptOutcome::NotCounted;
    };
    let Some(node) = graph.node(&ctx.current_node_id) else {
        return AttemptOutcome::NotCounted;
    };
    let Some(q) = node.as_question() else {
        return AttemptOutcome::NotCounted;
    };
    if ctx.pending_field.as_deref() != Some(q.key.as_str()) || ctx.state.is_absorbing() {
        return AttemptOutcome::NotCounted;
    }

    let count = ctx.attempts.entry(node.id.clone()).or_insert(0);
    *count += 1;
    let count = *count;
    if count < node.max_attempts {
        return AttemptOutcome::Counted(count);
    }

    if node.skippable {
        ctx.attempts.remove(&node.id);
        if !ctx.skipped.contains(&node.id) {
            ctx.skipped.push(node.id.clone());
        }
        ctx.pending_field = None;
        AttemptOutcome::Skipped(node.id.clone())
    } else {
        ctx.state = TurnState::Escalated {
            reason: format!("no answer for '{}' after {count} attempts", q.key),
        };
        AttemptOutcome::Exhausted(node.id.clone())
    }
}
