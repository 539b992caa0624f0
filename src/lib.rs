//! convoflow - a conversational flow engine
//!
//! Conversations are driven by declarative graphs ([`flow`]). Each inbound
//! message is one turn: deterministic steps run without the model, then the
//! [`responder`] asks an LLM for exactly one structured decision, which is
//! applied atomically to the session's [`context`]. The [`runtime`] serializes
//! turns per session and persists contexts through pluggable stores.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod config;
pub mod context;
pub mod db;
pub mod flow;
pub mod llm;
pub mod responder;
pub mod runtime;
pub mod state_machine;
pub mod tools;

pub use config::{EngineConfig, LlmConfig};
pub use context::{FlowContext, SessionKey};
pub use flow::{CompiledFlow, FlowCatalog, FlowDocument, FlowLibrary, GuardEvaluator};
pub use runtime::{InboundMessage, RuntimeError, TurnDisposition, TurnResult, TurnRunner};
