//! Mock implementations for testing
//!
//! These mocks drive the turn runner end to end without real I/O.

use super::traits::{ContextStore, StoreError};
use crate::context::{FlowContext, SessionKey};
use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, LlmService, Usage};
use crate::responder::TOOL_NAME;
use crate::tools::{ActionContext, ActionExecutor, ActionResult};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> Result<LlmResponse, LlmError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

#[async_trait]
impl LlmService for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.next_response()
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Mock LLM client with configurable delay (for testing supersession)
pub struct DelayedMockLlmClient {
    inner: MockLlmClient,
    delay: Duration,
    /// Notified when a request starts (for test synchronization)
    pub request_started: Arc<Notify>,
}

impl DelayedMockLlmClient {
    pub fn new(model_id: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner: MockLlmClient::new(model_id),
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.inner.queue_response(response);
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.inner.recorded_requests()
    }
}

#[async_trait]
impl LlmService for DelayedMockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.inner.requests.lock().unwrap().push(request.clone());
        self.request_started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.next_response()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

/// A response carrying one `perform_action` call
pub fn perform(messages: &[&str], actions: Value) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::tool_use(
            "toolu_1",
            TOOL_NAME,
            json!({
                "messages": messages,
                "actions": actions,
                "confidence": 0.9,
                "reasoning": "test",
            }),
        )],
        end_turn: true,
        usage: Usage::default(),
    }
}

// ============================================================================
// Mock Action Executor
// ============================================================================

/// Executor returning a fixed result and recording its calls
pub struct MockActionExecutor {
    name: String,
    result: ActionResult,
    calls: Mutex<Vec<(Map<String, Value>, Value)>>,
}

impl MockActionExecutor {
    pub fn new(name: impl Into<String>, result: ActionResult) -> Self {
        Self {
            name: name.into(),
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(parameters, context)` of every call so far
    pub fn recorded_calls(&self) -> Vec<(Map<String, Value>, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for MockActionExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Mock {}", self.name)
    }

    async fn execute(&self, parameters: Map<String, Value>, ctx: ActionContext) -> ActionResult {
        self.calls.lock().unwrap().push((parameters, ctx.to_value()));
        self.result.clone()
    }
}

// ============================================================================
// In-Memory Context Store
// ============================================================================

/// Context store keeping serialized contexts, so every load is a fresh copy
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: Mutex<HashMap<SessionKey, Value>>,
    saves: Mutex<usize>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<FlowContext> {
        let contexts = self.contexts.lock().unwrap();
        contexts
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).expect("stored context deserializes"))
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<FlowContext>, StoreError> {
        let contexts = self.contexts.lock().unwrap();
        contexts
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    async fn save(&self, context: &FlowContext) -> Result<(), StoreError> {
        let value = serde_json::to_value(context).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.contexts.lock().unwrap().insert(context.key(), value);
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::Role;
    use crate::flow::{FlowCatalog, FlowDocument, FlowLibrary, GuardEvaluator, SwitchRejection};
    use crate::runtime::{
        InMemoryLockStore, InboundMessage, TurnDisposition, TurnResult, TurnRunner, HANDOFF_NOTICE,
    };
    use crate::state_machine::SAFE_DEFAULT_MESSAGE;
    use crate::tools::ActionRegistry;

    type Runner<L> = TurnRunner<Arc<InMemoryContextStore>, Arc<InMemoryLockStore>, Arc<L>>;

    fn catalog(documents: Vec<Value>) -> Arc<FlowCatalog> {
        let library = documents.into_iter().fold(FlowLibrary::new(), |lib, d| {
            lib.with(FlowDocument::from_value(d).unwrap())
        });
        Arc::new(FlowCatalog::compile(&library, &GuardEvaluator::new()).unwrap())
    }

    fn runner_with<L: LlmService>(
        flows: &Arc<FlowCatalog>,
        llm: &Arc<L>,
        store: &Arc<InMemoryContextStore>,
        locks: &Arc<InMemoryLockStore>,
    ) -> Runner<L> {
        TurnRunner::new(
            flows.clone(),
            Arc::new(GuardEvaluator::new()),
            llm.clone(),
            store.clone(),
            locks.clone(),
            EngineConfig::default(),
        )
    }

    fn runner<L: LlmService>(flows: Vec<Value>, llm: &Arc<L>) -> Runner<L> {
        runner_with(
            &catalog(flows),
            llm,
            &Arc::new(InMemoryContextStore::new()),
            &Arc::new(InMemoryLockStore::new()),
        )
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage::new("user-1", "session-1", text)
    }

    fn key() -> SessionKey {
        SessionKey::new("user-1", "session-1")
    }

    async fn completed<L: LlmService>(runner: &Runner<L>, message: InboundMessage) -> TurnResult {
        match runner.handle_message(message).await.unwrap() {
            TurnDisposition::Completed(result) => *result,
            other => panic!("expected a completed turn, got {other:?}"),
        }
    }

    fn two_node() -> Value {
        json!({
            "schema_version": 1,
            "id": "main",
            "entry": "ask_name",
            "nodes": [
                {"id": "ask_name", "kind": "question", "key": "name", "prompt": "What's your name?"},
                {"id": "done", "kind": "terminal", "reason": "collected", "message": "All set!"}
            ],
            "edges": [
                {"source": "ask_name", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "name"}}}
            ]
        })
    }

    // ------------------------------------------------------------------
    // Happy path
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_two_turn_conversation_completes() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Hi! What's your name?"], json!([{"action": "stay"}])));
        llm.queue_response(perform(
            &["Nice to meet you, Ana."],
            json!([{"action": "update_answers", "updates": {"name": "Ana"}}]),
        ));
        let runner = runner(vec![two_node()], &llm);

        let first = completed(&runner, msg("hello")).await;
        assert!(!first.terminal);
        assert!(!first.escalate);
        assert_eq!(first.current_node_id, "ask_name");
        assert_eq!(first.pending_field.as_deref(), Some("name"));
        assert_eq!(first.tool_name.as_deref(), Some(TOOL_NAME));
        assert_eq!(first.messages[0].text, "Hi! What's your name?");
        assert_eq!(first.assistant_message, "Hi! What's your name?");
        assert_eq!(first.reasoning, "test");
        assert!(first.metadata.llm_called);

        let second = completed(&runner, msg("I'm Ana")).await;
        assert!(second.terminal);
        assert_eq!(second.current_node_id, "done");
        assert_eq!(second.navigation.as_deref(), Some("done"));
        assert_eq!(second.updated_answers["name"], "Ana");
        assert!(second.messages.iter().any(|m| m.text == "All set!"));
        assert!(second.messages.iter().all(|m| m.delay_ms.is_some()));
        assert_eq!(second.assistant_message, "Nice to meet you, Ana.\nAll set!");

        let serialized = serde_json::to_value(&second).unwrap();
        assert_eq!(serialized["reasoning"], "test");
        assert_eq!(serialized["assistant_message"], "Nice to meet you, Ana.\nAll set!");

        let stored = runner.store().get(&key()).unwrap();
        assert_eq!(stored.turn_count, 2);
        assert_eq!(stored.answers["name"], "Ana");
        assert_eq!(llm.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_message_after_completion_restarts() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Thanks!"], json!([{"action": "update_answers", "updates": {"name": "Ana"}}])));
        llm.queue_response(perform(&["Welcome back, name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        assert!(completed(&runner, msg("Ana")).await.terminal);
        let again = completed(&runner, msg("hi again")).await;
        assert!(!again.terminal);
        assert_eq!(again.current_node_id, "ask_name");
        assert_eq!(again.updated_answers["name"], Value::Null);
    }

    // ------------------------------------------------------------------
    // Deduplication
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_redelivered_message_is_duplicate() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        completed(&runner, msg("hello").with_message_id("m1")).await;
        let again = runner.handle_message(msg("hello").with_message_id("m1")).await.unwrap();
        assert_eq!(again, TurnDisposition::Duplicate);
        assert_eq!(llm.recorded_requests().len(), 1);
        assert_eq!(runner.store().save_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_is_dropped() {
        let llm = Arc::new(DelayedMockLlmClient::new("mock", Duration::from_millis(100)));
        llm.queue_response(perform(&["Name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        let (a, b) = tokio::join!(
            runner.handle_message(msg("hello").with_message_id("m1")),
            runner.handle_message(msg("hello").with_message_id("m1")),
        );
        let dispositions = [a.unwrap(), b.unwrap()];
        assert_eq!(dispositions.iter().filter(|d| d.result().is_some()).count(), 1);
        assert!(dispositions.contains(&TurnDisposition::Duplicate));
        assert_eq!(llm.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_instances_sharing_a_store_process_once() {
        let flows = catalog(vec![two_node()]);
        let store = Arc::new(InMemoryContextStore::new());
        let locks = Arc::new(InMemoryLockStore::new());
        let llm_a = Arc::new(DelayedMockLlmClient::new("a", Duration::from_millis(150)));
        let llm_b = Arc::new(MockLlmClient::new("b"));
        llm_a.queue_response(perform(&["Name?"], json!([])));
        llm_b.queue_response(perform(&["Name?"], json!([])));
        let a = runner_with(&flows, &llm_a, &store, &locks);
        let b = runner_with(&flows, &llm_b, &store, &locks);

        let delivery = msg("hello").with_message_id("m1");
        let (first, second) = tokio::join!(a.handle_message(delivery.clone()), async {
            llm_a.request_started.notified().await;
            b.handle_message(delivery.clone()).await
        });

        assert!(first.unwrap().result().is_some());
        assert_eq!(second.unwrap(), TurnDisposition::Duplicate);
        assert!(llm_b.recorded_requests().is_empty());
        assert_eq!(store.save_count(), 1);
        assert!(locks.holder(&key().lock_key()).is_none());
    }

    // ------------------------------------------------------------------
    // Degradation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_tool_degrades_to_safe_default() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(LlmResponse {
            content: vec![ContentBlock::tool_use("t1", "launch_rockets", json!({}))],
            end_turn: true,
            usage: Usage::default(),
        });
        let runner = runner(vec![two_node()], &llm);

        let result = completed(&runner, msg("hello")).await;
        assert_eq!(result.tool_name, None);
        assert!(!result.escalate);
        assert!(!result.terminal);
        assert_eq!(result.messages[0].text, SAFE_DEFAULT_MESSAGE);
        assert!(result.confidence.abs() < f64::EPSILON);
        assert!(result.metadata.degraded.as_deref().unwrap().contains("launch_rockets"));
        assert!(result.reasoning.starts_with("safe default"));
        assert_eq!(result.assistant_message, SAFE_DEFAULT_MESSAGE);
    }

    #[tokio::test]
    async fn test_llm_error_degrades_to_safe_default() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_error(LlmError::server_error("overloaded"));
        let runner = runner(vec![two_node()], &llm);

        let result = completed(&runner, msg("hello")).await;
        assert_eq!(result.messages[0].text, SAFE_DEFAULT_MESSAGE);
        assert_eq!(result.current_node_id, "ask_name");
        assert!(result.metadata.degraded.as_deref().unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_hard_rejected_decision_changes_nothing() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(
            &["Moving on"],
            json!([
                {"action": "update_answers", "updates": {"name": "Ana"}},
                {"action": "navigate", "target": "nowhere"}
            ]),
        ));
        let runner = runner(vec![two_node()], &llm);

        let result = completed(&runner, msg("Ana")).await;
        assert_eq!(result.tool_name, None);
        assert!(result.updated_answers.is_empty());
        assert_eq!(result.current_node_id, "ask_name");
        assert!(runner.store().get(&key()).unwrap().answers.is_empty());
    }

    // ------------------------------------------------------------------
    // External actions
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_external_action_outcome_in_metadata() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(
            &["Let me check."],
            json!([{"action": "execute_action", "name": "crm_lookup", "parameters": {"email": "a@b.co"}}]),
        ));
        llm.queue_response(perform(
            &["Trying again."],
            json!([{"action": "execute_action", "name": "crm_down"}]),
        ));
        let crm = Arc::new(MockActionExecutor::new("crm_lookup", ActionResult::success("found")));
        let down = Arc::new(MockActionExecutor::new("crm_down", ActionResult::failure("503")));
        let runner = runner(vec![two_node()], &llm)
            .with_actions(ActionRegistry::new().with(crm.clone()).with(down.clone()));

        let ok = completed(&runner, msg("look me up")).await;
        assert!(ok.metadata.external_action_executed);
        assert_eq!(ok.metadata.external_action_successful, Some(true));
        assert_eq!(ok.metadata.actions[0].name, "crm_lookup");
        let calls = crm.recorded_calls();
        assert_eq!(calls[0].0["email"], "a@b.co");
        assert_eq!(calls[0].1["session_id"], "session-1");

        let failed = completed(&runner, msg("again")).await;
        assert_eq!(failed.metadata.external_action_successful, Some(false));
        assert_eq!(failed.metadata.actions[0].error.as_deref(), Some("503"));
        assert!(!failed.escalate);
        assert_eq!(failed.messages[0].text, "Trying again.");
    }

    #[tokio::test]
    async fn test_action_node_runs_without_llm() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let mut data = Map::new();
        data.insert("region".into(), json!("north"));
        let geo = Arc::new(MockActionExecutor::new("geo", ActionResult::success("ok").with_data(data)));
        let flow = json!({
            "schema_version": 1,
            "id": "lookup",
            "entry": "locate",
            "nodes": [
                {"id": "locate", "kind": "action", "action_type": "geo", "output_keys": ["region"]},
                {"id": "done", "kind": "terminal", "message": "Found your region."}
            ],
            "edges": [
                {"source": "locate", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "region"}}}
            ]
        });
        let runner = runner(vec![flow], &llm).with_actions(ActionRegistry::new().with(geo));

        let result = completed(&runner, msg("where am I")).await;
        assert!(result.terminal);
        assert!(!result.metadata.llm_called);
        assert!(llm.recorded_requests().is_empty());
        assert_eq!(result.metadata.auto_advanced, vec!["done".to_string()]);
        assert_eq!(result.metadata.actions[0].node_id.as_deref(), Some("locate"));
        assert_eq!(result.updated_answers["region"], "north");
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(result.messages[0].text, "Found your region.");
    }

    #[tokio::test]
    async fn test_failed_action_node_escalates() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let flow = json!({
            "schema_version": 1,
            "id": "lookup",
            "entry": "locate",
            "nodes": [
                {"id": "locate", "kind": "action", "action_type": "geo", "output_keys": ["region"]},
                {"id": "done", "kind": "terminal"}
            ],
            "edges": [
                {"source": "locate", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "region"}}}
            ]
        });
        let runner = runner(vec![flow], &llm);

        let result = completed(&runner, msg("where am I")).await;
        assert!(result.escalate);
        assert_eq!(result.metadata.external_action_successful, Some(false));
        assert_eq!(result.messages[0].text, HANDOFF_NOTICE);
    }

    // ------------------------------------------------------------------
    // Supersession
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_newer_message_supersedes_older_turn() {
        let llm = Arc::new(DelayedMockLlmClient::new("mock", Duration::from_millis(200)));
        llm.queue_response(perform(&["Got both, what's your name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        let (old, new) = tokio::join!(runner.handle_message(msg("first").with_message_id("m1")), async {
            llm.request_started.notified().await;
            runner.handle_message(msg("second").with_message_id("m2")).await
        });

        assert_eq!(old.unwrap(), TurnDisposition::Superseded);
        let new = new.unwrap().into_result().unwrap();
        assert_eq!(new.metadata.sequence, 2);
        assert_eq!(new.messages[0].text, "Got both, what's your name?");

        let stored = runner.store().get(&key()).unwrap();
        let texts: Vec<&str> = stored.history.iter().map(|h| h.text.as_str()).collect();
        assert!(texts.contains(&"first"));
        assert!(texts.contains(&"second"));
        assert_eq!(stored.turn_count, 1);
        assert_eq!(runner.store().save_count(), 1);
    }

    #[tokio::test]
    async fn test_resent_text_without_id_is_recorded_once() {
        let llm = Arc::new(DelayedMockLlmClient::new("mock", Duration::from_millis(200)));
        llm.queue_response(perform(&["What's your name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        let (old, new) = tokio::join!(runner.handle_message(msg("hello")), async {
            llm.request_started.notified().await;
            runner.handle_message(msg("hello")).await
        });

        assert_eq!(old.unwrap(), TurnDisposition::Superseded);
        assert!(new.unwrap().result().is_some());

        let stored = runner.store().get(&key()).unwrap();
        let greetings = stored
            .history
            .iter()
            .filter(|h| h.role == Role::User && h.text == "hello")
            .count();
        assert_eq!(greetings, 1);

        let requests = llm.recorded_requests();
        let state = &requests.last().unwrap().system[1].text;
        assert_eq!(state.matches("user: hello").count(), 1);
    }

    // ------------------------------------------------------------------
    // Escalation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_handoff_then_notice_without_llm() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(
            &["Connecting you with a person."],
            json!([{"action": "request_human_handoff", "reason": "asked for a human"}]),
        ));
        let runner = runner(vec![two_node()], &llm);

        let first = completed(&runner, msg("I want a human")).await;
        assert!(first.escalate);
        assert_eq!(first.messages[0].text, "Connecting you with a person.");

        let after = completed(&runner, msg("hello?")).await;
        assert!(after.escalate);
        assert_eq!(after.messages[0].text, HANDOFF_NOTICE);
        assert!(!after.metadata.llm_called);
        assert_eq!(llm.recorded_requests().len(), 1);
    }

    fn one_question(skippable: bool) -> Value {
        json!({
            "schema_version": 1,
            "id": "contact",
            "entry": "ask_email",
            "nodes": [
                {"id": "ask_email", "kind": "question", "key": "email", "data_type": "email",
                 "prompt": "Email?", "skippable": skippable, "max_attempts": 2},
                {"id": "done", "kind": "terminal"}
            ],
            "edges": [
                {"source": "ask_email", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "email"}}}
            ]
        })
    }

    #[tokio::test]
    async fn test_skippable_question_skipped_after_attempts() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Could you share your email?"], json!([])));
        llm.queue_response(perform(&["No problem."], json!([])));
        let runner = runner(vec![one_question(true)], &llm);

        assert!(!completed(&runner, msg("no")).await.terminal);
        let second = completed(&runner, msg("still no")).await;
        assert_eq!(second.metadata.skipped_question.as_deref(), Some("ask_email"));
        assert!(second.terminal);
    }

    #[tokio::test]
    async fn test_required_question_escalates_after_attempts() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Could you share your email?"], json!([])));
        llm.queue_response(perform(&["I really need it."], json!([])));
        let runner = runner(vec![one_question(false)], &llm);

        assert!(!completed(&runner, msg("no")).await.escalate);
        let second = completed(&runner, msg("no")).await;
        assert!(second.escalate);
        assert!(!second.terminal);
    }

    #[tokio::test]
    async fn test_invalid_answer_is_rejected_softly() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(
            &["Thanks"],
            json!([{"action": "update_answers", "updates": {"email": "not-an-email"}}]),
        ));
        let runner = runner(vec![one_question(false)], &llm);

        let result = completed(&runner, msg("not-an-email")).await;
        assert_eq!(result.current_node_id, "ask_email");
        assert!(result.updated_answers.is_empty());
        assert_eq!(result.metadata.rejected_updates[0].0, "email");
        assert_eq!(result.tool_name.as_deref(), Some(TOOL_NAME));
    }

    // ------------------------------------------------------------------
    // Subflows, paths and chaining
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_subflow_round_trip() {
        let address = json!({
            "schema_version": 1,
            "id": "address",
            "entry": "ask_city",
            "nodes": [
                {"id": "ask_city", "kind": "question", "key": "city", "prompt": "City?"},
                {"id": "ok", "kind": "terminal"}
            ],
            "edges": [{"source": "ask_city", "target": "ok", "guard": {"fn": "answers_has", "args": {"key": "city"}}}]
        });
        let checkout = json!({
            "schema_version": 1,
            "id": "checkout",
            "entry": "collect",
            "nodes": [
                {"id": "collect", "kind": "subflow", "flow_ref": "address",
                 "output_mapping": {"shipping_city": "city"}},
                {"id": "done", "kind": "terminal", "reason": "shipped"}
            ],
            "edges": [{"source": "collect", "target": "done"}]
        });
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Which city?"], json!([])));
        llm.queue_response(perform(&["Great."], json!([{"action": "update_answers", "updates": {"city": "Porto"}}])));
        let runner = runner(vec![address, checkout], &llm).with_actions(ActionRegistry::new());

        let first = completed(&runner, msg("hi").with_flow("checkout")).await;
        assert_eq!(first.current_node_id, "ask_city");
        assert_eq!(first.pending_field.as_deref(), Some("city"));
        assert_eq!(runner.store().get(&key()).unwrap().frames.len(), 1);

        let second = completed(&runner, msg("Porto")).await;
        assert!(second.terminal);
        assert_eq!(second.flow_id, "checkout");
        assert_eq!(second.updated_answers["shipping_city"], "Porto");
        assert!(runner.store().get(&key()).unwrap().frames.is_empty());
    }

    #[tokio::test]
    async fn test_path_locks_after_threshold() {
        let triage = json!({
            "schema_version": 1,
            "id": "triage",
            "entry": "route",
            "nodes": [
                {"id": "route", "kind": "decision", "paths": [
                    {"name": "sales", "target": "ask_budget",
                     "entry": [{"fn": "keyword", "args": {"any": ["buy"]}}], "answer_keys": ["budget"]},
                    {"name": "support", "target": "ask_issue",
                     "entry": [{"fn": "keyword", "args": {"any": ["broken"]}}], "answer_keys": ["issue"]}
                ]},
                {"id": "ask_budget", "kind": "question", "key": "budget", "prompt": "Budget?", "max_attempts": 5},
                {"id": "ask_issue", "kind": "question", "key": "issue", "prompt": "Issue?", "max_attempts": 5},
                {"id": "done", "kind": "terminal"}
            ],
            "edges": [
                {"source": "ask_budget", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "budget"}}},
                {"source": "ask_issue", "target": "done", "guard": {"fn": "answers_has", "args": {"key": "issue"}}}
            ]
        });
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["What budget?"], json!([])));
        llm.queue_response(perform(&["Any range is fine."], json!([])));
        llm.queue_response(perform(
            &["Let me switch."],
            json!([{"action": "switch_path", "path": "support", "reason": "user changed mind"}]),
        ));
        let runner = runner(vec![triage], &llm);

        let first = completed(&runner, msg("I want to buy")).await;
        assert_eq!(first.active_path.as_deref(), Some("sales"));
        assert_eq!(first.current_node_id, "ask_budget");
        assert!(!runner.store().get(&key()).unwrap().path.path_locked);

        completed(&runner, msg("hmm")).await;
        assert!(runner.store().get(&key()).unwrap().path.path_locked);

        let third = completed(&runner, msg("actually my phone is broken")).await;
        assert_eq!(third.active_path.as_deref(), Some("sales"));
        assert_eq!(third.current_node_id, "ask_budget");
        assert_eq!(
            third.metadata.rejected_switches,
            vec![("support".to_string(), SwitchRejection::Locked)]
        );
    }

    #[tokio::test]
    async fn test_terminal_chains_into_next_flow() {
        let intro = json!({
            "schema_version": 1,
            "id": "intro",
            "entry": "ask_name",
            "nodes": [
                {"id": "ask_name", "kind": "question", "key": "name", "prompt": "Name?"},
                {"id": "end", "kind": "terminal", "next_flow": "survey"}
            ],
            "edges": [{"source": "ask_name", "target": "end", "guard": {"fn": "answers_has", "args": {"key": "name"}}}]
        });
        let survey = json!({
            "schema_version": 1,
            "id": "survey",
            "entry": "ask_score",
            "nodes": [
                {"id": "ask_score", "kind": "question", "key": "score", "data_type": "integer", "prompt": "Score 1-10?"},
                {"id": "thanks", "kind": "terminal"}
            ],
            "edges": [{"source": "ask_score", "target": "thanks", "guard": {"fn": "answers_has", "args": {"key": "score"}}}]
        });
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(
            &["Thanks Ana! One quick question."],
            json!([{"action": "update_answers", "updates": {"name": "Ana"}}]),
        ));
        let runner = runner(vec![intro, survey], &llm);

        let result = completed(&runner, msg("Ana").with_flow("intro")).await;
        assert!(!result.terminal);
        assert_eq!(result.flow_id, "survey");
        assert_eq!(result.current_node_id, "ask_score");
        assert_eq!(result.pending_field.as_deref(), Some("score"));
        assert_eq!(result.navigation.as_deref(), Some("ask_score"));
        assert_eq!(runner.store().get(&key()).unwrap().answers["name"], "Ana");
    }

    #[tokio::test]
    async fn test_unknown_flow_is_an_error() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        let runner = runner(vec![two_node()], &llm);
        let err = runner
            .handle_message(msg("hi").with_flow("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_prompt_carries_state() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(perform(&["Name?"], json!([])));
        let runner = runner(vec![two_node()], &llm);

        completed(&runner, msg("hello there").with_tenant("acme")).await;
        let request = &llm.recorded_requests()[0];
        assert_eq!(request.tool_choice.as_deref(), Some(TOOL_NAME));
        assert_eq!(request.tools[0].name, TOOL_NAME);
        assert_eq!(runner.store().get(&key()).unwrap().tenant_id, "acme");
    }
}
