//! Declarative conversation graphs
//!
//! Documents are parsed into the IR ([`document`]), validated and indexed by the
//! [`compiler`], and walked at runtime using [`guard`] evaluation and the
//! [`paths`] selector.

pub mod compiler;
pub mod document;
pub mod guard;
pub mod paths;

pub use compiler::{
    split_qualified, Compilation, CompiledFlow, Compiler, FlowCatalog, FlowLibrary,
    ValidationError,
};
pub use document::{
    ActionNode, DataType, DecisionNode, DecisionType, DocumentError, Edge, FlowDocument, Node,
    NodeKind, QuestionNode, SubflowNode, TerminalNode,
};
pub use guard::{is_filled, select_edge, EdgeChoice, Guard, GuardEvaluator, GuardScope};
pub use paths::{PathDefinition, PathSelector, PathState, SwitchRejection, SwitchVerdict};
