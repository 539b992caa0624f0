//! Engine configuration
//!
//! Everything has a default; `from_env` overrides individual values from
//! `CONVOFLOW_*` variables. Unparseable values are ignored with a warning.

use crate::responder::PromptLimits;
use crate::runtime::LockPolicy;
use std::time::Duration;

/// Tuning knobs for the turn runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// History entries kept in the context
    pub history_limit: usize,
    /// History entries shown to the model
    pub prompt_history_turns: usize,
    /// Deterministic steps allowed per advance phase
    pub max_auto_advance_hops: usize,
    pub llm_timeout: Duration,
    pub action_timeout: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    pub answer_summary_limit: usize,
    pub answer_value_chars: usize,
    pub llm_max_tokens: u32,
    /// Flow for sessions that do not name one
    pub default_flow: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            prompt_history_turns: 10,
            max_auto_advance_hops: 16,
            llm_timeout: Duration::from_secs(45),
            action_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(100),
            answer_summary_limit: 40,
            answer_value_chars: 200,
            llm_max_tokens: 1024,
            default_flow: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` uses the process environment
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let millis = |name: &str, fallback: Duration| {
            parsed::<u64, _>(&lookup, name).map_or(fallback, Duration::from_millis)
        };
        Self {
            history_limit: parsed(&lookup, "CONVOFLOW_HISTORY_LIMIT").unwrap_or(d.history_limit),
            prompt_history_turns: parsed(&lookup, "CONVOFLOW_PROMPT_HISTORY_TURNS")
                .unwrap_or(d.prompt_history_turns),
            max_auto_advance_hops: parsed(&lookup, "CONVOFLOW_MAX_AUTO_ADVANCE_HOPS")
                .unwrap_or(d.max_auto_advance_hops),
            llm_timeout: millis("CONVOFLOW_LLM_TIMEOUT_MS", d.llm_timeout),
            action_timeout: millis("CONVOFLOW_ACTION_TIMEOUT_MS", d.action_timeout),
            lock_ttl: millis("CONVOFLOW_LOCK_TTL_MS", d.lock_ttl),
            lock_wait: millis("CONVOFLOW_LOCK_WAIT_MS", d.lock_wait),
            lock_retry_interval: millis("CONVOFLOW_LOCK_RETRY_MS", d.lock_retry_interval),
            answer_summary_limit: parsed(&lookup, "CONVOFLOW_ANSWER_SUMMARY_LIMIT")
                .unwrap_or(d.answer_summary_limit),
            answer_value_chars: parsed(&lookup, "CONVOFLOW_ANSWER_VALUE_CHARS")
                .unwrap_or(d.answer_value_chars),
            llm_max_tokens: parsed(&lookup, "CONVOFLOW_LLM_MAX_TOKENS").unwrap_or(d.llm_max_tokens),
            default_flow: lookup("CONVOFLOW_DEFAULT_FLOW").filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            history_turns: self.prompt_history_turns,
            answer_entries: self.answer_summary_limit,
            answer_value_chars: self.answer_value_chars,
            max_tokens: self.llm_max_tokens,
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: self.lock_ttl,
            wait: self.lock_wait,
            retry_interval: self.lock_retry_interval,
        }
    }
}

fn parsed<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = %name, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Configuration for the LLM provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    /// Gateway URL that fronts the provider
    pub gateway: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            model: std::env::var("CONVOFLOW_MODEL").ok(),
        }
    }

    /// A gateway supplies credentials, so either is enough
    pub fn is_usable(&self) -> bool {
        self.anthropic_api_key.is_some() || self.gateway.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.history_limit, 20);
        assert_eq!(c.action_timeout, Duration::from_secs(60));
        assert_eq!(c.lock_policy().wait, Duration::from_secs(30));
        assert_eq!(c.prompt_limits().answer_entries, 40);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("CONVOFLOW_HISTORY_LIMIT", "5"),
            ("CONVOFLOW_LLM_TIMEOUT_MS", "1500"),
            ("CONVOFLOW_LOCK_WAIT_MS", "soon"),
            ("CONVOFLOW_DEFAULT_FLOW", "onboarding"),
        ]
        .into_iter()
        .collect();
        let c = EngineConfig::from_lookup(|name| vars.get(name).map(ToString::to_string));
        assert_eq!(c.history_limit, 5);
        assert_eq!(c.llm_timeout, Duration::from_millis(1500));
        assert_eq!(c.lock_wait, Duration::from_secs(30));
        assert_eq!(c.default_flow.as_deref(), Some("onboarding"));
    }

    #[test]
    fn test_llm_config_usability() {
        assert!(!LlmConfig::default().is_usable());
        let gw = LlmConfig {
            gateway: Some("http://gw".into()),
            ..Default::default()
        };
        assert!(gw.is_usable());
    }
}
