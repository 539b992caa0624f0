//! Flow compilation
//!
//! Turns a [`FlowDocument`] into a [`CompiledFlow`]: nodes indexed by id, edges
//! grouped by source in evaluation order, subflows compiled and attached.
//! Validation collects every problem it finds instead of stopping at the first
//! one, so editors can show them all at once.

use super::document::{cached_regex, Edge, FlowDocument, Node, NodeKind};
use super::guard::{Guard, GuardEvaluator};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// A problem found while compiling a flow. Every variant names the flow it
/// was found in, which matters once subflows are involved.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("[{flow}] Duplicate node id '{node_id}'")]
    DuplicateNodeId { flow: String, node_id: String },

    #[error("[{flow}] Entry node '{entry}' does not exist")]
    MissingEntry { flow: String, entry: String },

    #[error("[{flow}] Edge #{index} {endpoint} '{reference}' does not resolve to a node")]
    DanglingEdge {
        flow: String,
        index: usize,
        endpoint: &'static str,
        reference: String,
    },

    #[error("[{flow}] Terminal node '{node_id}' has outgoing edges")]
    TerminalHasEdges { flow: String, node_id: String },

    #[error("[{flow}] Node '{node_id}' references unknown subflow '{flow_ref}'")]
    UnknownSubflow {
        flow: String,
        node_id: String,
        flow_ref: String,
    },

    #[error("[{flow}] Subflow cycle: {}", chain.join(" -> "))]
    SubflowCycle { flow: String, chain: Vec<String> },

    #[error("[{flow}] {location} uses unknown guard function '{function}'")]
    UnknownGuard {
        flow: String,
        location: String,
        function: String,
    },

    #[error("[{flow}] {location} has invalid guard arguments: {message}")]
    InvalidGuardArgs {
        flow: String,
        location: String,
        message: String,
    },

    #[error("[{flow}] Question '{node_id}' has an invalid validator: {message}")]
    InvalidValidator {
        flow: String,
        node_id: String,
        message: String,
    },

    #[error("[{flow}] Path '{path}' on node '{node_id}' targets unknown node '{target}'")]
    PathTargetMissing {
        flow: String,
        node_id: String,
        path: String,
        target: String,
    },

    #[error("[{flow}] Node '{node_id}' declares path '{path}' more than once")]
    DuplicatePath {
        flow: String,
        node_id: String,
        path: String,
    },

    #[error("[{flow}] Node '{node_id}' is not reachable from the entry")]
    UnreachableNode { flow: String, node_id: String },

    #[error("[{flow}] Node '{node_id}' has no way forward")]
    DeadEndNode { flow: String, node_id: String },
}

// ============================================================================
// Compiled flow
// ============================================================================

/// A validated, indexed, traversal-ready flow
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFlow {
    pub id: String,
    pub entry: String,
    pub nodes: BTreeMap<String, Node>,
    /// Outgoing edges per source, in evaluation order
    pub edges_from: BTreeMap<String, Vec<Edge>>,
    pub subflows: BTreeMap<String, Arc<CompiledFlow>>,
    pub metadata: Map<String, Value>,
}

impl CompiledFlow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn entry_node(&self) -> Option<&Node> {
        self.nodes.get(&self.entry)
    }

    /// Outgoing edges of a node; empty for terminals and unknown ids
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.edges_from.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn subflow(&self, name: &str) -> Option<&Arc<CompiledFlow>> {
        self.subflows.get(name)
    }

    /// Resolve a local id or a qualified `flow_ref/node_id` reference.
    ///
    /// Returns the graph the node lives in and the node.
    pub fn resolve(&self, reference: &str) -> Option<(&CompiledFlow, &Node)> {
        if let Some(node) = self.nodes.get(reference) {
            return Some((self, node));
        }
        let (flow_ref, rest) = split_qualified(reference)?;
        self.subflows.get(flow_ref)?.resolve(rest)
    }

    /// Walk down a chain of subflow names
    pub fn graph_at<'a, I>(&self, flow_refs: I) -> Option<&CompiledFlow>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut graph = self;
        for name in flow_refs {
            graph = graph.subflows.get(name)?;
        }
        Some(graph)
    }

    /// The editor/visualizer projection
    pub fn projection(&self) -> Value {
        let nodes: Map<String, Value> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), serde_json::to_value(node).unwrap_or(Value::Null)))
            .collect();

        let edges_from: Map<String, Value> = self
            .edges_from
            .iter()
            .map(|(source, edges)| {
                let list = edges
                    .iter()
                    .map(|e| {
                        json!({
                            "source": e.source,
                            "target": e.target,
                            "priority": e.priority,
                            "label": e.label,
                            "condition_description": e.condition_description,
                        })
                    })
                    .collect();
                (source.clone(), Value::Array(list))
            })
            .collect();

        let subflows: Map<String, Value> = self
            .subflows
            .iter()
            .map(|(name, flow)| (name.clone(), flow.projection()))
            .collect();

        json!({
            "id": self.id,
            "entry": self.entry,
            "nodes": nodes,
            "edges_from": edges_from,
            "metadata": self.metadata,
            "subflows": subflows,
        })
    }
}

/// Split `flow_ref/node_id` at the first slash
pub fn split_qualified(reference: &str) -> Option<(&str, &str)> {
    reference
        .split_once('/')
        .filter(|(flow, node)| !flow.is_empty() && !node.is_empty())
}

/// Output of a compile: the flow plus everything wrong with it
#[derive(Debug, Clone)]
pub struct Compilation {
    pub flow: Arc<CompiledFlow>,
    pub errors: Vec<ValidationError>,
}

impl Compilation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The flow if it compiled cleanly, the collected errors otherwise
    pub fn into_result(self) -> Result<Arc<CompiledFlow>, Vec<ValidationError>> {
        if self.errors.is_empty() {
            Ok(self.flow)
        } else {
            Err(self.errors)
        }
    }
}

// ============================================================================
// Library and compiler
// ============================================================================

/// Named flow documents available for subflow and `next_flow` resolution
#[derive(Debug, Clone, Default)]
pub struct FlowLibrary {
    documents: BTreeMap<String, FlowDocument>,
}

impl FlowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document under its own id, replacing any previous one
    pub fn insert(&mut self, document: FlowDocument) {
        self.documents.insert(document.id.clone(), document);
    }

    #[must_use]
    pub fn with(mut self, document: FlowDocument) -> Self {
        self.insert(document);
        self
    }

    pub fn get(&self, id: &str) -> Option<&FlowDocument> {
        self.documents.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

struct CachedFlow {
    flow: Arc<CompiledFlow>,
    errors: Vec<ValidationError>,
}

/// Compiles documents against a library, caching compiled subflows by name
pub struct Compiler<'a> {
    library: &'a FlowLibrary,
    evaluator: &'a GuardEvaluator,
    cache: HashMap<String, CachedFlow>,
    stack: Vec<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(library: &'a FlowLibrary, evaluator: &'a GuardEvaluator) -> Self {
        Self {
            library,
            evaluator,
            cache: HashMap::new(),
            stack: Vec::new(),
        }
    }

    /// Compile a document from the library by id
    pub fn compile_named(&mut self, id: &str) -> Option<Compilation> {
        let document = self.library.get(id)?;
        Some(self.compile(document))
    }

    /// Compile a document. Subflow errors are included, each reported once.
    pub fn compile(&mut self, document: &FlowDocument) -> Compilation {
        let mut reported = HashSet::new();
        let mut errors = Vec::new();
        let flow = self.compile_inner(document, &mut errors, &mut reported);
        Compilation { flow, errors }
    }

    fn compile_inner(
        &mut self,
        document: &FlowDocument,
        errors: &mut Vec<ValidationError>,
        reported: &mut HashSet<String>,
    ) -> Arc<CompiledFlow> {
        let flow_id = document.id.clone();
        self.stack.push(flow_id.clone());

        // 1. Index nodes; first declaration wins
        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        for node in &document.nodes {
            if nodes.contains_key(&node.id) {
                errors.push(ValidationError::DuplicateNodeId {
                    flow: flow_id.clone(),
                    node_id: node.id.clone(),
                });
            } else {
                nodes.insert(node.id.clone(), node.clone());
            }
        }

        if !nodes.contains_key(&document.entry) {
            errors.push(ValidationError::MissingEntry {
                flow: flow_id.clone(),
                entry: document.entry.clone(),
            });
        }

        // 2. Compile referenced subflows before checking references into them
        let mut subflows: BTreeMap<String, Arc<CompiledFlow>> = BTreeMap::new();
        for node in nodes.values() {
            let NodeKind::Subflow(sub) = &node.kind else {
                continue;
            };
            if subflows.contains_key(&sub.flow_ref) {
                continue;
            }
            if self.stack.contains(&sub.flow_ref) {
                let mut chain = self.stack.clone();
                chain.push(sub.flow_ref.clone());
                errors.push(ValidationError::SubflowCycle {
                    flow: flow_id.clone(),
                    chain,
                });
                continue;
            }
            if let Some(compiled) = self.subflow(&sub.flow_ref, errors, reported) {
                subflows.insert(sub.flow_ref.clone(), compiled);
            } else {
                errors.push(ValidationError::UnknownSubflow {
                    flow: flow_id.clone(),
                    node_id: node.id.clone(),
                    flow_ref: sub.flow_ref.clone(),
                });
            }
        }

        let resolves = |reference: &str| -> bool {
            if nodes.contains_key(reference) {
                return true;
            }
            match split_qualified(reference) {
                Some((flow_ref, rest)) => subflows
                    .get(flow_ref)
                    .is_some_and(|sub| sub.resolve(rest).is_some()),
                None => false,
            }
        };

        // 3. Node-local checks
        for node in nodes.values() {
            match &node.kind {
                NodeKind::Question(q) => {
                    if let Some(pattern) = &q.validator {
                        if let Err(e) = cached_regex(pattern) {
                            errors.push(ValidationError::InvalidValidator {
                                flow: flow_id.clone(),
                                node_id: node.id.clone(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                NodeKind::Decision(d) => {
                    let mut seen = HashSet::new();
                    for path in &d.paths {
                        if !seen.insert(path.name.as_str()) {
                            errors.push(ValidationError::DuplicatePath {
                                flow: flow_id.clone(),
                                node_id: node.id.clone(),
                                path: path.name.clone(),
                            });
                        }
                        if !resolves(&path.target) {
                            errors.push(ValidationError::PathTargetMissing {
                                flow: flow_id.clone(),
                                node_id: node.id.clone(),
                                path: path.name.clone(),
                                target: path.target.clone(),
                            });
                        }
                        for guard in &path.entry {
                            let location = format!("Path '{}' on node '{}'", path.name, node.id);
                            self.check_guard(&flow_id, location, guard, errors);
                        }
                    }
                }
                NodeKind::Terminal(_) | NodeKind::Action(_) | NodeKind::Subflow(_) => {}
            }
        }

        // 4. Edges: resolve endpoints, drop the ones that cannot be followed
        let mut edges_from: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
        let mut terminals_reported: HashSet<&str> = HashSet::new();
        for (index, edge) in document.edges.iter().enumerate() {
            self.check_guard(&flow_id, format!("Edge #{index}"), &edge.guard, errors);

            let Some(source) = nodes.get(&edge.source) else {
                errors.push(ValidationError::DanglingEdge {
                    flow: flow_id.clone(),
                    index,
                    endpoint: "source",
                    reference: edge.source.clone(),
                });
                continue;
            };
            if !resolves(&edge.target) {
                errors.push(ValidationError::DanglingEdge {
                    flow: flow_id.clone(),
                    index,
                    endpoint: "target",
                    reference: edge.target.clone(),
                });
                continue;
            }
            if source.is_terminal() {
                if terminals_reported.insert(source.id.as_str()) {
                    errors.push(ValidationError::TerminalHasEdges {
                        flow: flow_id.clone(),
                        node_id: source.id.clone(),
                    });
                }
                continue;
            }
            edges_from
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
        }

        // sort_by_key is stable, so ties keep declaration order
        for edges in edges_from.values_mut() {
            edges.sort_by_key(|e| e.priority);
        }

        // 5. Reachability and dead ends
        if nodes.contains_key(&document.entry) {
            let reached = reachable(&document.entry, &nodes, &edges_from);
            for id in nodes.keys() {
                if !reached.contains(id.as_str()) {
                    errors.push(ValidationError::UnreachableNode {
                        flow: flow_id.clone(),
                        node_id: id.clone(),
                    });
                }
            }
        }
        for node in nodes.values() {
            let has_edges = edges_from.contains_key(&node.id);
            let dead_end = match &node.kind {
                NodeKind::Terminal(_) => false,
                NodeKind::Decision(d) => !has_edges && d.paths.is_empty(),
                NodeKind::Question(_) | NodeKind::Action(_) | NodeKind::Subflow(_) => !has_edges,
            };
            if dead_end {
                errors.push(ValidationError::DeadEndNode {
                    flow: flow_id.clone(),
                    node_id: node.id.clone(),
                });
            }
        }

        self.stack.pop();

        tracing::debug!(
            flow = %flow_id,
            nodes = nodes.len(),
            subflows = subflows.len(),
            "Compiled flow"
        );

        Arc::new(CompiledFlow {
            id: flow_id,
            entry: document.entry.clone(),
            nodes,
            edges_from,
            subflows,
            metadata: document.metadata.clone(),
        })
    }

    fn subflow(
        &mut self,
        name: &str,
        errors: &mut Vec<ValidationError>,
        reported: &mut HashSet<String>,
    ) -> Option<Arc<CompiledFlow>> {
        if let Some(cached) = self.cache.get(name) {
            if reported.insert(name.to_string()) {
                errors.extend(cached.errors.iter().cloned());
            }
            return Some(Arc::clone(&cached.flow));
        }

        let document = self.library.get(name)?;
        let mut child_errors = Vec::new();
        let flow = self.compile_inner(document, &mut child_errors, reported);
        if reported.insert(name.to_string()) {
            errors.extend(child_errors.iter().cloned());
        }
        self.cache.insert(
            name.to_string(),
            CachedFlow {
                flow: Arc::clone(&flow),
                errors: child_errors,
            },
        );
        Some(flow)
    }

    fn check_guard(
        &self,
        flow: &str,
        location: String,
        guard: &Guard,
        errors: &mut Vec<ValidationError>,
    ) {
        if !self.evaluator.knows(&guard.function) {
            errors.push(ValidationError::UnknownGuard {
                flow: flow.to_string(),
                location,
                function: guard.function.clone(),
            });
            return;
        }
        if let Some(Err(message)) = guard.check_builtin_args() {
            errors.push(ValidationError::InvalidGuardArgs {
                flow: flow.to_string(),
                location,
                message,
            });
        }
    }
}

/// Local node ids reachable from `entry` via edges and path targets
fn reachable<'n>(
    entry: &'n str,
    nodes: &'n BTreeMap<String, Node>,
    edges_from: &'n BTreeMap<String, Vec<Edge>>,
) -> HashSet<&'n str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(entry);
    queue.push_back(entry);

    while let Some(id) = queue.pop_front() {
        let Some(node) = nodes.get(id) else { continue };
        let edge_targets = edges_from
            .get(id)
            .into_iter()
            .flatten()
            .map(|e| e.target.as_str());
        let path_targets = node.paths().iter().map(|p| p.target.as_str());
        for target in edge_targets.chain(path_targets) {
            if nodes.contains_key(target) && seen.insert(target) {
                queue.push_back(target);
            }
        }
    }
    seen
}

// ============================================================================
// Catalog
// ============================================================================

/// Every flow of a library, compiled and validated
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, Arc<CompiledFlow>>,
}

impl FlowCatalog {
    /// Compile every document in the library. Fails with all collected errors
    /// if any flow is invalid.
    pub fn compile(
        library: &FlowLibrary,
        evaluator: &GuardEvaluator,
    ) -> Result<Self, Vec<ValidationError>> {
        let mut compiler = Compiler::new(library, evaluator);
        let mut flows = BTreeMap::new();
        let mut errors = Vec::new();
        let mut seen_errors = HashSet::new();

        for id in library.ids() {
            let Some(compilation) = compiler.compile_named(id) else {
                continue;
            };
            // A flow used as a subflow elsewhere reports its errors more than once
            for err in compilation.errors {
                if seen_errors.insert(err.to_string()) {
                    errors.push(err);
                }
            }
            flows.insert(id.to_string(), compilation.flow);
        }

        if errors.is_empty() {
            Ok(Self { flows })
        } else {
            Err(errors)
        }
    }

    pub fn from_flows<I>(flows: I) -> Self
    where
        I: IntoIterator<Item = Arc<CompiledFlow>>,
    {
        Self {
            flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<CompiledFlow>> {
        self.flows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }
}
