//! Guard evaluation
//!
//! A guard is `{fn, args}`. Three functions are built in:
//!
//! - `always` - true unconditionally
//! - `answers_has(key)` - true iff `answers[key]` is present and non-empty
//! - `keyword(any: [..])` - true iff the evaluated text contains one of the
//!   keywords, case-insensitive, on token boundaries
//!
//! Anything else must be registered on the [`GuardEvaluator`] as an extension.
//! Evaluation is pure and total: malformed arguments or unknown functions
//! evaluate to `false`, they never panic.

use super::document::{cached_regex, Edge};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const GUARD_ALWAYS: &str = "always";
pub const GUARD_ANSWERS_HAS: &str = "answers_has";
pub const GUARD_KEYWORD: &str = "keyword";

/// Functions the evaluator understands without registration
pub const BUILTIN_GUARDS: &[&str] = &[GUARD_ALWAYS, GUARD_ANSWERS_HAS, GUARD_KEYWORD];

/// A boolean predicate gating edge traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl Default for Guard {
    fn default() -> Self {
        Self::always()
    }
}

impl Guard {
    pub fn always() -> Self {
        Self {
            function: GUARD_ALWAYS.to_string(),
            args: Map::new(),
        }
    }

    pub fn answers_has(key: impl Into<String>) -> Self {
        let mut args = Map::new();
        args.insert("key".to_string(), Value::String(key.into()));
        Self {
            function: GUARD_ANSWERS_HAS.to_string(),
            args,
        }
    }

    pub fn keyword<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let any = keywords
            .into_iter()
            .map(|k| Value::String(k.into()))
            .collect();
        let mut args = Map::new();
        args.insert("any".to_string(), Value::Array(any));
        Self {
            function: GUARD_KEYWORD.to_string(),
            args,
        }
    }

    pub fn custom(function: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Check the arguments of a built-in guard.
    ///
    /// Returns `None` for extension functions; their arguments are opaque here.
    pub fn check_builtin_args(&self) -> Option<Result<(), String>> {
        match self.function.as_str() {
            GUARD_ALWAYS => Some(Ok(())),
            GUARD_ANSWERS_HAS => Some(match self.args.get("key") {
                Some(Value::String(k)) if !k.is_empty() => Ok(()),
                _ => Err("answers_has requires a non-empty string 'key'".to_string()),
            }),
            GUARD_KEYWORD => Some(match self.args.get("any") {
                Some(Value::Array(items))
                    if !items.is_empty() && items.iter().all(Value::is_string) =>
                {
                    Ok(())
                }
                _ => Err("keyword requires 'any' to be a non-empty list of strings".to_string()),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}()", self.function)
        } else {
            write!(f, "{}({})", self.function, Value::Object(self.args.clone()))
        }
    }
}

/// What a guard is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct GuardScope<'a> {
    pub answers: &'a Map<String, Value>,
    /// The text keyword guards look at, usually the latest user message
    pub text: &'a str,
}

impl<'a> GuardScope<'a> {
    pub fn new(answers: &'a Map<String, Value>, text: &'a str) -> Self {
        Self { answers, text }
    }
}

/// True when an answer value carries information.
///
/// `null`, blank strings, empty lists and empty objects count as empty.
pub fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Signature of an extension guard function
pub type GuardFn = Arc<dyn Fn(&Map<String, Value>, &GuardScope<'_>) -> bool + Send + Sync>;

/// Evaluates guards: the built-in vocabulary plus registered extensions
#[derive(Clone, Default)]
pub struct GuardEvaluator {
    extensions: HashMap<String, GuardFn>,
}

impl fmt::Debug for GuardEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.extensions.keys().collect();
        names.sort();
        f.debug_struct("GuardEvaluator")
            .field("extensions", &names)
            .finish()
    }
}

impl GuardEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension function. Built-in names cannot be overridden.
    #[must_use]
    pub fn with_extension<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Map<String, Value>, &GuardScope<'_>) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        if BUILTIN_GUARDS.contains(&name.as_str()) {
            tracing::warn!(guard = %name, "Ignoring extension that shadows a built-in guard");
            return self;
        }
        self.extensions.insert(name, Arc::new(function));
        self
    }

    /// Whether `function` names a built-in or registered guard
    pub fn knows(&self, function: &str) -> bool {
        BUILTIN_GUARDS.contains(&function) || self.extensions.contains_key(function)
    }

    pub fn evaluate(&self, guard: &Guard, scope: &GuardScope<'_>) -> bool {
        match guard.function.as_str() {
            GUARD_ALWAYS => true,
            GUARD_ANSWERS_HAS => guard
                .args
                .get("key")
                .and_then(Value::as_str)
                .and_then(|key| scope.answers.get(key))
                .is_some_and(is_filled),
            GUARD_KEYWORD => match guard.args.get("any") {
                Some(Value::Array(keywords)) => keywords
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|k| contains_keyword(scope.text, k)),
                _ => false,
            },
            other => self
                .extensions
                .get(other)
                .is_some_and(|f| f(&guard.args, scope)),
        }
    }
}

/// Case-insensitive keyword search that respects token boundaries.
///
/// "no" matches "No, thanks" but not "nothing"; multi-word keywords match as
/// a phrase.
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    let keyword = keyword.trim();
    if keyword.is_empty() || text.is_empty() {
        return false;
    }
    let pattern = format!(
        r"(?i)(?:^|[^\p{{L}}\p{{N}}_]){}(?:$|[^\p{{L}}\p{{N}}_])",
        regex::escape(keyword)
    );
    cached_regex(&pattern).is_ok_and(|re| re.is_match(text))
}

/// Outcome of resolving a node's outgoing edges
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeChoice<'e> {
    /// Exactly one edge wins at the lowest satisfied priority
    Advance(&'e Edge),
    /// Several edges with the same priority hold and disagree on the target
    Ambiguous(Vec<&'e Edge>),
    /// No guard holds
    Blocked,
}

/// Pick the edge to follow from a priority-ordered edge list.
pub fn select_edge<'e>(
    evaluator: &GuardEvaluator,
    edges: &'e [Edge],
    scope: &GuardScope<'_>,
) -> EdgeChoice<'e> {
    let Some(first) = edges.iter().find(|e| evaluator.evaluate(&e.guard, scope)) else {
        return EdgeChoice::Blocked;
    };

    let tied: Vec<&Edge> = edges
        .iter()
        .filter(|e| e.priority == first.priority && evaluator.evaluate(&e.guard, scope))
        .collect();

    if tied.iter().any(|e| e.target != first.target) {
        EdgeChoice::Ambiguous(tied)
    } else {
        EdgeChoice::Advance(first)
    }
}
