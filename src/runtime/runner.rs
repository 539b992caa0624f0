//! Turn runner
//!
//! `handle_message` is the only entry point. Per message it:
//!
//! 1. admits the message through the session sequencer (drops in-flight
//!    duplicates, cancels the older turn of the same session),
//! 2. takes the distributed session lock,
//! 3. loads or creates the `FlowContext`,
//! 4. auto-advances, asks the Responder once, applies the decision
//!    atomically, dispatches external actions and auto-advances again,
//! 5. saves the context and releases the lock.
//!
//! Business failures never escape a turn: they degrade to the safe default or
//! escalate. Only store, lock and catalog problems surface as `RuntimeError`.

use super::result::{ExecutedAction, InboundMessage, TurnDisposition, TurnMetadata, TurnResult};
use super::session::{acquire_lock, LockOutcome, SessionSequencer, TurnTicket};
use super::traits::{ContextStore, LockStore, StoreError};
use crate::config::EngineConfig;
use crate::context::{diff_answers, FlowContext, Role, SessionKey};
use crate::flow::{CompiledFlow, FlowCatalog, GuardEvaluator, NodeKind, PathSelector};
use crate::llm::LlmService;
use crate::responder::{ActionListing, Responder, TurnInput};
use crate::state_machine::{
    apply_sequence, follow_edges, record_action_output, register_unproductive_turn, step,
    AppliedSequence, AttemptOutcome, Decision, DisplayMessage, Step, TurnState,
    SAFE_DEFAULT_MESSAGE,
};
use crate::tools::{ActionContext, ActionRegistry, ActionResult};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reply for messages arriving after a handoff
pub const HANDOFF_NOTICE: &str =
    "A member of our team will take it from here and get back to you shortly.";

/// Failures that cross the turn boundary
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Context store failed: {0}")]
    Store(StoreError),

    #[error("Session lock unavailable for {0}")]
    LockUnavailable(String),

    #[error("Flow '{0}' is not loaded")]
    FlowNotFound(String),

    #[error("Context for {key} is unusable: {message}")]
    CorruptContext { key: String, message: String },
}

impl From<StoreError> for RuntimeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { key, message } => RuntimeError::CorruptContext { key, message },
            other @ StoreError::Backend(_) => RuntimeError::Store(other),
        }
    }
}

/// Drives conversations over a catalog of compiled flows
pub struct TurnRunner<S, K, L> {
    catalog: Arc<FlowCatalog>,
    evaluator: Arc<GuardEvaluator>,
    responder: Responder<L>,
    actions: ActionRegistry,
    listings: Vec<ActionListing>,
    store: S,
    locks: K,
    sequencer: SessionSequencer,
    config: EngineConfig,
}

impl<S, K, L> TurnRunner<S, K, L>
where
    S: ContextStore,
    K: LockStore,
    L: LlmService,
{
    pub fn new(
        catalog: Arc<FlowCatalog>,
        evaluator: Arc<GuardEvaluator>,
        llm: L,
        store: S,
        locks: K,
        config: EngineConfig,
    ) -> Self {
        let responder = Responder::new(llm, config.prompt_limits(), config.llm_timeout);
        Self {
            catalog,
            evaluator,
            responder,
            actions: ActionRegistry::new(),
            listings: Vec::new(),
            store,
            locks,
            sequencer: SessionSequencer::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.listings = actions
            .catalog()
            .into_iter()
            .map(|(name, description, parameters)| ActionListing {
                name,
                description,
                parameters,
            })
            .collect();
        self.actions = actions;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process one inbound message to completion
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<TurnDisposition, RuntimeError> {
        let key = SessionKey::new(&msg.user_id, &msg.session_id);
        let Some(ticket) = self.sequencer.begin(&key, msg.message_id.as_deref()) else {
            tracing::info!(
                session_id = %key.session_id,
                message_id = msg.message_id.as_deref().unwrap_or(""),
                "Dropping duplicate delivery already in flight"
            );
            return Ok(TurnDisposition::Duplicate);
        };

        let outcome = self.run_ticket(&key, &msg, &ticket).await;
        self.sequencer.finish(&ticket);
        outcome
    }

    async fn run_ticket(
        &self,
        key: &SessionKey,
        msg: &InboundMessage,
        ticket: &TurnTicket,
    ) -> Result<TurnDisposition, RuntimeError> {
        let lock_key = key.lock_key();
        let lease = match acquire_lock(&self.locks, &lock_key, self.config.lock_policy(), &ticket.cancel).await {
            Ok(LockOutcome::Acquired(lease)) => lease,
            Ok(LockOutcome::Cancelled) => {
                self.sequencer.defer(ticket, &msg.text);
                tracing::info!(session_id = %key.session_id, seq = ticket.seq, "Turn superseded while waiting for lock");
                return Ok(TurnDisposition::Superseded);
            }
            Ok(LockOutcome::TimedOut) => return Err(RuntimeError::LockUnavailable(lock_key)),
            Err(e) => return Err(RuntimeError::LockUnavailable(format!("{lock_key}: {e}"))),
        };

        let outcome = self.run_locked(key, msg, ticket).await;
        lease.release(&self.locks).await;
        outcome
    }

    async fn run_locked(
        &self,
        key: &SessionKey,
        msg: &InboundMessage,
        ticket: &TurnTicket,
    ) -> Result<TurnDisposition, RuntimeError> {
        let (mut ctx, root) = self.load_or_create(key, msg).await?;

        if let Some(id) = msg.message_id.as_deref() {
            if ctx.has_processed(id) {
                tracing::info!(session_id = %key.session_id, message_id = %id, "Dropping duplicate delivery");
                return Ok(TurnDisposition::Duplicate);
            }
        }

        // A resent copy of this message may have been deferred by the turn it superseded
        let mut carried = self.sequencer.take_deferred(key);
        carried.retain(|text| *text != msg.text);
        for text in &carried {
            ctx.push_history(Role::User, text.as_str(), self.config.history_limit);
        }

        let processed = self.process_turn(ctx, root, msg, &ticket.cancel, ticket.seq).await;
        match processed {
            Some((ctx, result)) if !ticket.is_superseded() => {
                self.store.save(&ctx).await?;
                tracing::info!(
                    session_id = %key.session_id,
                    seq = ticket.seq,
                    node = %result.current_node_id,
                    state = result.state.name(),
                    llm_called = result.metadata.llm_called,
                    degraded = result.metadata.degraded.is_some(),
                    reasoning = %result.reasoning,
                    "Turn completed"
                );
                Ok(TurnDisposition::Completed(Box::new(result)))
            }
            _ => {
                for text in &carried {
                    self.sequencer.defer(ticket, text);
                }
                self.sequencer.defer(ticket, &msg.text);
                tracing::info!(session_id = %key.session_id, seq = ticket.seq, "Turn superseded, reply discarded");
                Ok(TurnDisposition::Superseded)
            }
        }
    }

    async fn load_or_create(
        &self,
        key: &SessionKey,
        msg: &InboundMessage,
    ) -> Result<(FlowContext, Arc<CompiledFlow>), RuntimeError> {
        if let Some(ctx) = self.store.load(key).await? {
            let root = self
                .catalog
                .get(&ctx.flow_id)
                .cloned()
                .ok_or_else(|| RuntimeError::FlowNotFound(ctx.flow_id.clone()))?;
            let positioned = ctx
                .active_graph(&root)
                .is_some_and(|g| g.node(&ctx.current_node_id).is_some());
            if !positioned {
                return Err(RuntimeError::CorruptContext {
                    key: key.to_string(),
                    message: format!("node '{}' is not in flow '{}'", ctx.current_node_id, ctx.flow_id),
                });
            }
            return Ok((ctx, root));
        }

        let flow_id = msg
            .flow_id
            .clone()
            .or_else(|| self.config.default_flow.clone())
            .or_else(|| {
                let mut ids = self.catalog.ids();
                match (ids.next(), ids.next()) {
                    (Some(only), None) => Some(only.to_string()),
                    _ => None,
                }
            })
            .ok_or_else(|| RuntimeError::FlowNotFound("(no default flow)".to_string()))?;
        let root = self
            .catalog
            .get(&flow_id)
            .cloned()
            .ok_or(RuntimeError::FlowNotFound(flow_id))?;

        tracing::info!(session_id = %key.session_id, flow = %root.id, "Starting new conversation");
        let mut ctx = FlowContext::new(key, &root);
        if let Some(tenant) = &msg.tenant_id {
            ctx.tenant_id.clone_from(tenant);
        }
        if let Some(channel) = &msg.channel_id {
            ctx.channel_id.clone_from(channel);
        }
        Ok((ctx, root))
    }

    /// The turn proper. `None` means the turn was superseded.
    async fn process_turn(
        &self,
        mut ctx: FlowContext,
        mut root: Arc<CompiledFlow>,
        msg: &InboundMessage,
        cancel: &CancellationToken,
        seq: u64,
    ) -> Option<(FlowContext, TurnResult)> {
        let mut meta = TurnMetadata {
            sequence: seq,
            ..TurnMetadata::default()
        };
        let before_answers = ctx.answers.clone();
        let start = (ctx.flow_id.clone(), ctx.current_node_id.clone());

        ctx.turn_count += 1;
        if let Some(id) = &msg.message_id {
            ctx.remember_message_id(id.as_str());
        }

        if ctx.state.is_escalated() {
            ctx.push_history(Role::User, msg.text.as_str(), self.config.history_limit);
            let messages = vec![DisplayMessage::new(HANDOFF_NOTICE)];
            let result = self.finish_turn(&mut ctx, &root, messages, None, meta, &before_answers, &start);
            return Some((ctx, result));
        }
        if ctx.state.is_terminal() {
            tracing::info!(session_id = %ctx.session_id, "Message after completion, starting over");
            ctx.restart(&root, false);
        }

        ctx.state = TurnState::Deciding;
        ctx.push_history(Role::User, msg.text.as_str(), self.config.history_limit);

        self.advance(&mut ctx, &mut root, &msg.text, cancel, &mut meta).await;
        if cancel.is_cancelled() {
            return None;
        }

        let mut decision = None;
        if !ctx.state.is_absorbing() {
            let (next, made) = self
                .decide_and_apply(ctx, &mut root, msg, cancel, &mut meta)
                .await?;
            ctx = next;
            decision = Some(made);
        }

        if ctx.state == TurnState::Deciding {
            ctx.state = TurnState::AwaitingInput;
        }
        count_path_turn(&mut ctx, &root);

        let messages = decision.as_ref().map(|d| d.messages.clone()).unwrap_or_default();
        let result = self.finish_turn(&mut ctx, &root, messages, decision.as_ref(), meta, &before_answers, &start);
        Some((ctx, result))
    }

    /// Responder call, atomic application, external dispatch, post-advance
    /// and attempt accounting
    async fn decide_and_apply(
        &self,
        ctx: FlowContext,
        root: &mut Arc<CompiledFlow>,
        msg: &InboundMessage,
        cancel: &CancellationToken,
        meta: &mut TurnMetadata,
    ) -> Option<(FlowContext, Decision)> {
        let position = (ctx.current_node_id.clone(), ctx.frames.len());
        let input = TurnInput {
            context: &ctx,
            root: &**root,
            message: &msg.text,
            is_admin: msg.is_admin,
            actions: &self.listings,
        };
        let proposed = self.responder.decide(&input, cancel).await?;
        meta.llm_called = true;

        let (decision, mut ctx) = match apply_sequence(&ctx, root, &proposed.actions, msg.is_admin) {
            Ok(applied) => {
                let next = self.dispatch_and_fold(applied, cancel, meta).await;
                (proposed, next)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    node = %ctx.current_node_id,
                    error = %e,
                    "Decision rejected, nothing applied"
                );
                (Decision::safe_default(e.to_string()), ctx)
            }
        };
        meta.tool_name.clone_from(&decision.tool_name);
        meta.degraded.clone_from(&decision.degraded);
        if cancel.is_cancelled() {
            return None;
        }

        self.advance(&mut ctx, root, &msg.text, cancel, meta).await;

        let stayed = (ctx.current_node_id.clone(), ctx.frames.len()) == position;
        if stayed && !ctx.state.is_absorbing() {
            match register_unproductive_turn(&mut ctx, root) {
                AttemptOutcome::Skipped(node_id) => {
                    tracing::info!(session_id = %ctx.session_id, node = %node_id, "Skipping question after repeated attempts");
                    meta.skipped_question = Some(node_id);
                    self.advance(&mut ctx, root, &msg.text, cancel, meta).await;
                }
                AttemptOutcome::Exhausted(node_id) => {
                    tracing::info!(session_id = %ctx.session_id, node = %node_id, "Attempts exhausted, escalating");
                }
                AttemptOutcome::Counted(_) | AttemptOutcome::NotCounted => {}
            }
        }
        Some((ctx, decision))
    }

    /// Run the decision's external effects and fold their outcome into the
    /// metadata. Failures never undo the applied sequence.
    async fn dispatch_and_fold(
        &self,
        applied: AppliedSequence,
        cancel: &CancellationToken,
        meta: &mut TurnMetadata,
    ) -> FlowContext {
        let calls: Vec<(String, Map<String, Value>)> = applied
            .external_calls()
            .map(|(name, params)| (name.to_string(), params.clone()))
            .collect();
        for (name, parameters) in calls {
            let result = self.run_external(&applied.context, &name, parameters, cancel).await;
            meta.record_action(executed(name, None, &result));
        }

        meta.rejected_updates = applied.rejected_updates;
        meta.rejected_switches = applied.rejected_switches;
        meta.kept_updates = applied.kept_updates;
        meta.cleared_answers = applied.cleared_answers;
        applied.context
    }

    /// Deterministic steps until the conversation needs input
    async fn advance(
        &self,
        ctx: &mut FlowContext,
        root: &mut Arc<CompiledFlow>,
        text: &str,
        cancel: &CancellationToken,
        meta: &mut TurnMetadata,
    ) {
        let mut hops = 0usize;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let next = match step(ctx, root, &self.evaluator, text) {
                Ok(next) => next,
                Err(e) => return fault(ctx, meta, &e.to_string()),
            };

            let moved_to = match next {
                Step::Moved { to, .. } => to,
                Step::Wait | Step::Finished { .. } | Step::Escalated { .. } => return,
                Step::RunAction { node_id, action } => {
                    let result = self
                        .run_external(ctx, &action.action_type, action.action_config.clone(), cancel)
                        .await;
                    record_action_output(ctx, &action.output_keys, &result.data);
                    meta.record_action(executed(action.action_type, Some(node_id), &result));
                    if cancel.is_cancelled() {
                        return;
                    }
                    match follow_edges(ctx, root, &self.evaluator, text) {
                        Ok(Step::Moved { to, .. }) => to,
                        Ok(_) => return,
                        Err(e) => return fault(ctx, meta, &e.to_string()),
                    }
                }
                Step::ChainFlow { flow_id, reason } => {
                    let Some(next_flow) = self.catalog.get(&flow_id).cloned() else {
                        tracing::warn!(session_id = %ctx.session_id, flow = %flow_id, "Chained flow is not loaded, finishing here");
                        ctx.state = TurnState::Terminal { reason, success: true };
                        return;
                    };
                    tracing::info!(session_id = %ctx.session_id, from = %ctx.flow_id, to = %flow_id, "Continuing in chained flow");
                    ctx.restart(&next_flow, true);
                    ctx.state = TurnState::Deciding;
                    *root = next_flow;
                    ctx.current_node_id.clone()
                }
            };

            meta.auto_advanced.push(moved_to);
            hops += 1;
            if hops > self.config.max_auto_advance_hops {
                ctx.state = TurnState::Escalated {
                    reason: "auto-advance did not settle".to_string(),
                };
                tracing::error!(session_id = %ctx.session_id, node = %ctx.current_node_id, hops, "Auto-advance hop limit reached");
                return;
            }
        }
    }

    async fn run_external(
        &self,
        ctx: &FlowContext,
        name: &str,
        parameters: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> ActionResult {
        let action_ctx = ActionContext {
            cancel: cancel.clone(),
            user_id: ctx.user_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            session_id: ctx.session_id.clone(),
            flow_id: ctx.flow_id.clone(),
            node_id: ctx.current_node_id.clone(),
            answers: ctx.answers.clone(),
        };
        self.actions
            .execute(name, parameters, action_ctx, self.config.action_timeout)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_turn(
        &self,
        ctx: &mut FlowContext,
        root: &CompiledFlow,
        mut messages: Vec<DisplayMessage>,
        decision: Option<&Decision>,
        meta: TurnMetadata,
        before_answers: &Map<String, Value>,
        start: &(String, String),
    ) -> TurnResult {
        if ctx.state.is_terminal() {
            if let Some(closing) = terminal_message(ctx, root) {
                if !messages.iter().any(|m| m.text == closing) {
                    messages.push(DisplayMessage::new(closing));
                }
            }
        }
        if messages.is_empty() && ctx.state.is_escalated() {
            messages.push(DisplayMessage::new(HANDOFF_NOTICE));
        }
        if messages.is_empty() {
            let fallback = ctx
                .active_graph(root)
                .and_then(|g| g.node(&ctx.current_node_id))
                .and_then(|n| n.prompt())
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(SAFE_DEFAULT_MESSAGE);
            messages.push(DisplayMessage::new(fallback));
        }

        let messages: Vec<DisplayMessage> = messages.into_iter().map(DisplayMessage::with_default_delay).collect();
        for m in &messages {
            ctx.push_history(Role::Assistant, m.text.as_str(), self.config.history_limit);
        }
        ctx.touch();

        let moved = (ctx.flow_id.as_str(), ctx.current_node_id.as_str()) != (start.0.as_str(), start.1.as_str());
        let assistant_message = messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>().join("\n");
        TurnResult {
            messages,
            assistant_message,
            reasoning: decision.map(|d| d.reasoning.clone()).unwrap_or_default(),
            flow_id: ctx.flow_id.clone(),
            current_node_id: ctx.current_node_id.clone(),
            state: ctx.state.clone(),
            terminal: ctx.state.is_terminal(),
            escalate: ctx.state.is_escalated(),
            tool_name: decision.and_then(|d| d.tool_name.clone()),
            // Deterministic turns never consulted the model
            confidence: decision.map_or(1.0, |d| d.confidence),
            updated_answers: diff_answers(before_answers, &ctx.answers),
            navigation: moved.then(|| ctx.current_node_id.clone()),
            active_path: ctx.path.active_path.clone(),
            pending_field: ctx.pending_field.clone(),
            metadata: meta,
        }
    }
}

fn executed(name: String, node_id: Option<String>, result: &ActionResult) -> ExecutedAction {
    ExecutedAction {
        name,
        node_id,
        success: result.success,
        message: result.message.clone(),
        error: result.error.clone(),
    }
}

fn count_path_turn(ctx: &mut FlowContext, root: &CompiledFlow) {
    if ctx.state.is_absorbing() {
        return;
    }
    let Some(owner) = ctx.path.path_owner.as_deref() else {
        return;
    };
    let paths = ctx
        .active_graph(root)
        .and_then(|g| g.node(owner))
        .or_else(|| root.node(owner))
        .map(|n| n.paths().to_vec())
        .unwrap_or_default();
    let was_locked = ctx.path.path_locked;
    PathSelector::record_turn(&mut ctx.path, &paths);
    if ctx.path.path_locked && !was_locked {
        tracing::info!(
            session_id = %ctx.session_id,
            path = ctx.path.active_path.as_deref().unwrap_or(""),
            turns = ctx.path.turns_in_path,
            "Path locked"
        );
    }
}

/// Escalate on a broken context instead of failing the turn
fn fault(ctx: &mut FlowContext, meta: &mut TurnMetadata, reason: &str) {
    tracing::error!(session_id = %ctx.session_id, node = %ctx.current_node_id, error = %reason, "Flow fault, escalating");
    ctx.state = TurnState::Escalated {
        reason: "internal error".to_string(),
    };
    meta.degraded = Some(reason.to_string());
}

fn terminal_message(ctx: &FlowContext, root: &CompiledFlow) -> Option<String> {
    let node = ctx.active_graph(root)?.node(&ctx.current_node_id)?;
    match &node.kind {
        NodeKind::Terminal(t) => t.message.clone(),
        _ => None,
    }
}
