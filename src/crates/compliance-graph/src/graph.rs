//! Graph construction
//!
//! [`StateGraph`] is a mutable registry of nodes and edges. [`StateGraph::compile`]
//! validates it and freezes it into a [`CompiledGraph`], whose adjacency structure is
//! shared behind `Arc`s and never changes afterwards. One compiled graph can drive any
//! number of concurrent executions; all per-run data lives in the
//! [`ComplianceState`] passed to it.
//!
//! ```text
//!   set_entry_point("assess")
//!          │
//!          ▼
//!   ┌────────────┐  router(&state)  ┌──────────────┐      ┌──────────┐
//!   │   assess   │ ───────────────► │ human_review │ ───► │ finalize │ ───► END
//!   └────────────┘  "review"/"done" └──────────────┘      └──────────┘
//!          │ Err(_)
//!          ▼
//!   ┌───────────────┐
//!   │ error_handler │  built in; re-enters the failed node or ends the run
//!   └───────────────┘
//! ```
//!
//! # Routing
//!
//! After a node succeeds, its successor is resolved in this order:
//!
//! 1. the node's conditional router, if one is registered
//! 2. `next_node` set by the handler's patch
//! 3. the node's direct edge
//! 4. [`END`]
//!
//! Routers take `&ComplianceState` and return a name, so routing is a pure function
//! of the record and replays identically from a checkpoint.
//!
//! # Example
//!
//! ```rust
//! use compliance_graph::{StateGraph, StateUpdate, END};
//!
//! let mut graph = StateGraph::new();
//! graph.add_node("assess", |_state| async move {
//!     Ok(StateUpdate::new().compliance("frameworks", serde_json::json!(["SOC2"])))
//! });
//! graph.add_edge("assess", END);
//! graph.set_entry_point("assess");
//!
//! let compiled = graph.compile().unwrap();
//! assert_eq!(compiled.entry(), "assess");
//! ```

use crate::engine::EngineConfig;
use crate::error::{GraphError, NodeError, Result};
use crate::interrupt::InterruptConfig;
use crate::policy::{RecoveryPolicy, RetryPolicyEngine};
use crate::state::{ComplianceState, NodeId, StateUpdate};
use compliance_checkpoint::CheckpointSaver;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Terminal sentinel
pub const END: &str = "__end__";

/// Name of the built-in error handling node
pub const ERROR_HANDLER: &str = "error_handler";

/// Future returned by a node handler
pub type NodeFuture = BoxFuture<'static, std::result::Result<StateUpdate, NodeError>>;

/// Type-erased node handler
pub type NodeExecutor = Arc<dyn Fn(ComplianceState) -> NodeFuture + Send + Sync>;

/// Conditional routing function
pub type RouterFn = Arc<dyn Fn(&ComplianceState) -> String + Send + Sync>;

/// A registered node
#[derive(Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    pub executor: NodeExecutor,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec").field("name", &self.name).finish()
    }
}

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    /// Always continue to this node
    Direct(NodeId),

    /// Ask a router where to go
    ///
    /// With an empty `branches` map the router's answer is the node name itself;
    /// otherwise it is a key into `branches`.
    Conditional {
        router: RouterFn,
        branches: HashMap<String, NodeId>,
    },
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(to) => f.debug_tuple("Direct").field(to).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("branches", branches)
                .finish_non_exhaustive(),
        }
    }
}

/// Where the error handler sends a run it decided to retry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRouting {
    /// Re-enter the node named by the latest error
    #[default]
    FailedNode,
    /// Re-enter the last node that completed successfully
    LastSuccessfulNode,
}

/// Mutable graph builder
pub struct StateGraph {
    nodes: HashMap<NodeId, NodeSpec>,
    edges: HashMap<NodeId, Vec<Edge>>,
    entry: Option<NodeId>,
    interrupts: InterruptConfig,
    policy: Arc<dyn RecoveryPolicy>,
    recovery_routing: RecoveryRouting,
}

impl Default for StateGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl StateGraph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            interrupts: InterruptConfig::new(),
            policy: Arc::new(RetryPolicyEngine::default()),
            recovery_routing: RecoveryRouting::default(),
        }
    }

    /// Register a node handler
    ///
    /// Registering the same name twice replaces the earlier handler.
    pub fn add_node<F, Fut>(&mut self, name: impl Into<NodeId>, handler: F) -> &mut Self
    where
        F: Fn(ComplianceState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateUpdate, NodeError>> + Send + 'static,
    {
        let name = name.into();
        let executor: NodeExecutor = Arc::new(move |state| Box::pin(handler(state)));
        if self.nodes.contains_key(&name) {
            warn!(node = %name, "Replacing existing node handler");
        }
        self.nodes.insert(name.clone(), NodeSpec { name, executor });
        self
    }

    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Direct(to.into()));
        self
    }

    /// Route out of `from` with a router over named branches
    ///
    /// Pass an empty `branches` map when the router returns node names directly.
    pub fn add_conditional_edges<R>(
        &mut self,
        from: impl Into<NodeId>,
        router: R,
        branches: HashMap<String, NodeId>,
    ) -> &mut Self
    where
        R: Fn(&ComplianceState) -> String + Send + Sync + 'static,
    {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Conditional {
                router: Arc::new(router),
                branches,
            });
        self
    }

    pub fn set_entry_point(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.entry = Some(node.into());
        self
    }

    /// Mark nodes as human-confirmation breakpoints
    pub fn interrupt_before<I, S>(&mut self, nodes: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.interrupts = std::mem::take(&mut self.interrupts).with_interrupt_before(nodes);
        self
    }

    pub fn with_recovery_policy(&mut self, policy: Arc<dyn RecoveryPolicy>) -> &mut Self {
        self.policy = policy;
        self
    }

    pub fn with_recovery_routing(&mut self, routing: RecoveryRouting) -> &mut Self {
        self.recovery_routing = routing;
        self
    }

    fn check_target(&self, from: &str, to: &str) -> Result<()> {
        if to == END || self.nodes.contains_key(to) {
            Ok(())
        } else {
            Err(GraphError::Validation(format!(
                "Edge {from} -> {to} targets a node that does not exist"
            )))
        }
    }

    fn validate(&self) -> Result<NodeId> {
        for reserved in [END, ERROR_HANDLER] {
            if self.nodes.contains_key(reserved) {
                return Err(GraphError::Validation(format!(
                    "Node name {reserved} is reserved"
                )));
            }
        }

        let entry = self
            .entry
            .clone()
            .ok_or_else(|| GraphError::Validation("No entry point set".to_string()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::Validation(format!(
                "Entry point {entry} does not exist"
            )));
        }

        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "Edge source {from} does not exist"
                )));
            }
            if edges.len() > 1 {
                return Err(GraphError::Validation(format!(
                    "Node {from} has {} outgoing edges, expected at most one",
                    edges.len()
                )));
            }
            for edge in edges {
                match edge {
                    Edge::Direct(to) => self.check_target(from, to)?,
                    Edge::Conditional { branches, .. } => {
                        for to in branches.values() {
                            self.check_target(from, to)?;
                        }
                    }
                }
            }
        }

        for node in &self.interrupts.interrupt_before {
            if !self.nodes.contains_key(node) {
                return Err(GraphError::Validation(format!(
                    "Interrupt node {node} does not exist"
                )));
            }
        }

        Ok(entry)
    }

    /// Validate and freeze the graph
    pub fn compile(self) -> Result<CompiledGraph> {
        let entry = self.validate()?;

        let edges = self
            .edges
            .into_iter()
            .filter_map(|(from, mut edges)| edges.pop().map(|edge| (from, edge)))
            .collect();

        Ok(CompiledGraph {
            nodes: Arc::new(self.nodes),
            edges: Arc::new(edges),
            entry,
            interrupts: Arc::new(self.interrupts),
            policy: self.policy,
            recovery_routing: self.recovery_routing,
            checkpointer: None,
            config: EngineConfig::default(),
        })
    }
}

/// Immutable, executable graph
///
/// Cloning is cheap; clones share nodes, edges and the checkpointer.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) nodes: Arc<HashMap<NodeId, NodeSpec>>,
    pub(crate) edges: Arc<HashMap<NodeId, Edge>>,
    pub(crate) entry: NodeId,
    pub(crate) interrupts: Arc<InterruptConfig>,
    pub(crate) policy: Arc<dyn RecoveryPolicy>,
    pub(crate) recovery_routing: RecoveryRouting,
    pub(crate) checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub(crate) config: EngineConfig,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("nodes", &self.node_names())
            .field("interrupts", &self.interrupts)
            .field("recovery_routing", &self.recovery_routing)
            .field("checkpointer", &self.checkpointer.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl CompiledGraph {
    /// Attach a checkpoint store
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(saver);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn interrupts(&self) -> &InterruptConfig {
        &self.interrupts
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Sorted node names
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve the successor of `node` for `state`
    ///
    /// Returns the offending target name when routing leads to a node that does not
    /// exist.
    pub fn route(&self, node: &str, state: &ComplianceState) -> std::result::Result<NodeId, String> {
        let target = match self.edges.get(node) {
            Some(Edge::Conditional { router, branches }) => {
                let decision = router(state);
                if branches.is_empty() {
                    decision
                } else {
                    branches.get(&decision).cloned().ok_or(decision)?
                }
            }
            Some(Edge::Direct(to)) => state.next_node.clone().unwrap_or_else(|| to.clone()),
            None => state.next_node.clone().unwrap_or_else(|| END.to_string()),
        };

        if target == END || self.nodes.contains_key(&target) {
            Ok(target)
        } else {
            Err(target)
        }
    }
}
