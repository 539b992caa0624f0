//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::action::SubAction;
use super::transition::*;
use crate::context::{apply_updates, FlowContext, SessionKey};
use crate::flow::{is_filled, CompiledFlow, Compiler, FlowDocument, FlowLibrary, GuardEvaluator};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_flow() -> Arc<CompiledFlow> {
    let doc = FlowDocument::from_value(json!({
        "schema_version": 1,
        "id": "props",
        "entry": "a",
        "nodes": [
            {"id": "a", "kind": "question", "key": "k1", "prompt": "?"},
            {"id": "b", "kind": "question", "key": "k2", "prompt": "?"},
            {"id": "route", "kind": "decision", "paths": [
                {"name": "p1", "target": "c", "answer_keys": ["k3"]},
                {"name": "p2", "target": "d", "answer_keys": ["k4"]}
            ]},
            {"id": "c", "kind": "question", "key": "k3", "prompt": "?"},
            {"id": "d", "kind": "question", "key": "k4", "prompt": "?"},
            {"id": "end", "kind": "terminal"}
        ],
        "edges": [
            {"source": "a", "target": "b", "guard": {"fn": "answers_has", "args": {"key": "k1"}}},
            {"source": "b", "target": "route", "guard": {"fn": "answers_has", "args": {"key": "k2"}}},
            {"source": "c", "target": "end"},
            {"source": "d", "target": "end"}
        ]
    }))
    .unwrap();
    let library = FlowLibrary::new();
    let evaluator = GuardEvaluator::new();
    let compilation = Compiler::new(&library, &evaluator).compile(&doc);
    assert!(compilation.is_valid(), "{:?}", compilation.errors);
    compilation.flow
}

fn test_context(flow: &CompiledFlow) -> FlowContext {
    FlowContext::new(&SessionKey::new("user", "session"), flow)
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("k1".to_string()),
        Just("k2".to_string()),
        Just("k3".to_string()),
        Just("k4".to_string()),
        "[a-z]{1,3}",
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        Just(json!("")),
        Just(json!([])),
        "[a-zA-Z ]{0,8}".prop_map(Value::String),
        any::<i32>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(Value::Bool),
    ]
}

fn arb_answers() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map(arb_key(), arb_value(), 0..5)
        .prop_map(|m| m.into_iter().collect())
}

fn arb_target() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a".to_string()),
        Just("b".to_string()),
        Just("c".to_string()),
        Just("route".to_string()),
        Just("end".to_string()),
        Just("p1".to_string()),
        Just("p2".to_string()),
        "[a-z]{4,6}",
    ]
}

fn arb_sub_action() -> impl Strategy<Value = SubAction> {
    prop_oneof![
        Just(SubAction::Stay),
        arb_target().prop_map(|target| SubAction::Navigate { target }),
        arb_answers().prop_map(|updates| SubAction::UpdateAnswers { updates }),
        (arb_key(), arb_value()).prop_map(|(key, value)| SubAction::CorrectAnswer { key, value }),
        (prop_oneof![Just("p1"), Just("p2"), Just("p9")], any::<bool>()).prop_map(
            |(path, force)| SubAction::SwitchPath {
                path: path.to_string(),
                reason: None,
                force,
            }
        ),
        Just(SubAction::RequestHumanHandoff {
            reason: String::new()
        }),
        Just(SubAction::ConfirmCompletion),
        any::<bool>().prop_map(|keep_answers| SubAction::RestartConversation { keep_answers }),
        "[a-z]{1,8}".prop_map(|style| SubAction::UpdateCommunicationStyle { style }),
    ]
}

fn arb_position() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("a"), Just("b"), Just("route"), Just("c"), Just("d")]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // A filled answer survives any ordinary update
    #[test]
    fn prop_conservative_merge_never_overwrites(
        existing in arb_answers(),
        updates in arb_answers(),
    ) {
        let mut answers = existing.clone();
        let mut pending = None;
        apply_updates(&mut answers, &updates, &mut pending);

        for (key, value) in &existing {
            if is_filled(value) {
                prop_assert_eq!(answers.get(key), Some(value));
            }
        }
        for (key, value) in &updates {
            if is_filled(value) {
                prop_assert!(answers.get(key).is_some_and(is_filled));
            }
        }
    }

    // pending_field is cleared exactly when its key ends up filled
    #[test]
    fn prop_pending_cleared_iff_filled(
        existing in arb_answers(),
        updates in arb_answers(),
        pending_key in arb_key(),
    ) {
        let mut answers = existing;
        let mut pending = Some(pending_key.clone());
        apply_updates(&mut answers, &updates, &mut pending);
        let filled = answers.get(&pending_key).is_some_and(is_filled);
        prop_assert_eq!(pending.is_none(), filled);
    }

    // A sequence either fully commits or leaves the input untouched, and the
    // outcome is the same when repeated
    #[test]
    fn prop_sequences_are_atomic_and_deterministic(
        position in arb_position(),
        answers in arb_answers(),
        actions in proptest::collection::vec(arb_sub_action(), 0..6),
        is_admin in any::<bool>(),
    ) {
        let flow = test_flow();
        let mut ctx = test_context(&flow);
        ctx.current_node_id = position.to_string();
        ctx.answers = answers;
        ctx.sync_pending_field(&flow);
        let before = ctx.clone();

        let first = apply_sequence(&ctx, &flow, &actions, is_admin);
        let second = apply_sequence(&ctx, &flow, &actions, is_admin);
        prop_assert_eq!(&ctx, &before);

        match (first, second) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.effects, b.effects);
                prop_assert!(flow.node(&a.context.current_node_id).is_some());
                if !is_admin {
                    prop_assert_eq!(&a.context.communication_style, &before.communication_style);
                }
            }
            (Err(a), Err(b)) => prop_assert_eq!(a, b),
            (a, b) => prop_assert!(false, "non-deterministic: {:?} vs {:?}", a.is_ok(), b.is_ok()),
        }
    }

    // Once locked, ordinary switch requests never change the active path
    #[test]
    fn prop_locked_path_rejects_ordinary_switch(
        turns in 2u32..10,
        target in prop_oneof![Just("p1"), Just("p2")],
    ) {
        let flow = test_flow();
        let mut ctx = test_context(&flow);
        ctx.current_node_id = "route".into();
        let entered = apply_sequence(&ctx, &flow, &[SubAction::Navigate { target: "p2".into() }], false)
            .unwrap()
            .context;
        prop_assert_eq!(entered.path.active_path.as_deref(), Some("p2"));

        let mut ctx = entered;
        ctx.path.turns_in_path = turns;
        let switch = SubAction::SwitchPath { path: target.to_string(), reason: None, force: false };
        let applied = apply_sequence(&ctx, &flow, &[switch], false).unwrap();
        prop_assert_eq!(applied.context.path.active_path.as_deref(), Some("p2"));
        prop_assert_eq!(&applied.context.current_node_id, &ctx.current_node_id);
    }

    // Auto-advance never leaves the graph and stops within the node count
    #[test]
    fn prop_step_stays_in_graph(
        answers in arb_answers(),
        text in "[a-z ]{0,20}",
    ) {
        let flow = test_flow();
        let evaluator = GuardEvaluator::new();
        let mut ctx = test_context(&flow);
        ctx.answers = answers;
        ctx.sync_pending_field(&flow);

        let mut hops = 0;
        while let Ok(Step::Moved { to, .. }) = step(&mut ctx, &flow, &evaluator, &text) {
            prop_assert!(flow.node(&to).is_some());
            hops += 1;
            prop_assert!(hops <= flow.nodes.len());
        }
    }
}
