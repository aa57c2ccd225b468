//! # Flow Orchestration
//!
//! A flow is a directed graph of nodes keyed by id. Edges are labelled with
//! actions: after a node's `post` returns an action, the flow looks up
//! `(node, action)` and moves to the destination. When no edge matches, the
//! flow has finished successfully at that node.
//!
//! ```rust
//! # use pocketgraph::prelude::*;
//! # use pocketgraph::node::builtin::{LogNode, SetValueNode};
//! # use serde_json::json;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FlowError> {
//! let mut flow = FlowBuilder::new()
//!     .start_node("greet")
//!     .node("greet", Node::new(LogNode::new("hello", Action::simple("save"))))
//!     .node("save", Node::new(SetValueNode::new("greeted", json!(true), Action::none())))
//!     .route("greet", "save", "save")
//!     .build()?;
//!
//! let mut store = InMemorySharedStore::new();
//! let result = flow.execute(&mut store).await?;
//! assert_eq!(result.execution_path, vec!["greet", "save"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Each `(node, action)` pair has at most one edge; [`FlowBuilder::build`]
//!   rejects duplicates, unknown endpoints and a missing start node.
//! - Cycles are legal. Runaway loops are bounded only when the caller opts in
//!   to [`FlowConfig::max_steps`] or [`FlowConfig::timeout`]. The time guard is
//!   checked between nodes, so a running node always settles first.
//! - Guards nest: a sub-flow runs under its own limits and those of every
//!   enclosing flow, and its steps count against all of them.
//! - A node failure aborts the run with [`FlowError::Node`]; the store keeps
//!   whatever the completed nodes wrote.
//!
//! ## Composition
//!
//! [`FlowNode`] wraps a flow so it can be registered as a node of a larger
//! flow, and [`BatchFlow`] runs a flow once per parameter set.

use crate::node::{Deadline, ExecutionContext, NodeFailure, NodeRunner, Phase, StepBudget};
use crate::params::Params;
use crate::{Action, SharedStore, StorageBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, error, warn};

pub mod batch;

pub use batch::BatchFlow;

/// Errors raised while building or running a flow
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A node did not complete; the run was aborted
    #[error("node '{node_id}' failed: {failure}")]
    Node {
        node_id: String,
        #[source]
        failure: NodeFailure,
    },

    /// Carries the step limit that was reached
    #[error("maximum execution steps exceeded: {0}")]
    MaxStepsExceeded(usize),

    /// Carries the time limit that expired
    #[error("flow exceeded its time limit of {0:?}")]
    Timeout(Duration),

    #[error("node id registered twice: {0}")]
    DuplicateNode(String),

    #[error("route from '{node_id}' on action '{action}' registered twice")]
    DuplicateRoute { node_id: String, action: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid flow configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl FlowError {
    /// Id of the node that aborted the run
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            FlowError::Node { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            FlowError::Node { failure, .. } => Some(failure.phase),
            _ => None,
        }
    }

    /// Index of the batch item that sank the failing node
    pub fn item_index(&self) -> Option<usize> {
        match self {
            FlowError::Node { failure, .. } => failure.item,
            _ => None,
        }
    }

    /// The error raised inside nested flows, if the failure came from one
    pub fn innermost(&self) -> &FlowError {
        match self {
            FlowError::Node { failure, .. } => failure
                .downcast_ref::<FlowError>()
                .map_or(self, FlowError::innermost),
            _ => self,
        }
    }

    /// A step or time guard tripped, here or in a nested flow
    pub fn is_overrun(&self) -> bool {
        matches!(
            self.innermost(),
            FlowError::MaxStepsExceeded(_) | FlowError::Timeout(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlowError::DuplicateNode(_)
                | FlowError::DuplicateRoute { .. }
                | FlowError::NodeNotFound(_)
                | FlowError::InvalidConfiguration(_)
        )
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowExecutionResult {
    /// Action returned by the last node
    pub final_action: Action,
    /// The node the flow stopped at
    pub last_node_id: String,
    pub steps_executed: usize,
    /// Node ids in execution order, repeats included
    pub execution_path: Vec<String>,
}

/// Configuration for flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Starting node ID
    pub start_node_id: String,
    /// Abort once this many nodes have run, nested flows' nodes included
    pub max_steps: Option<usize>,
    /// Abort when a node finishes after this much time has passed
    pub timeout: Option<Duration>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            start_node_id: "start".to_string(),
            max_steps: None,
            timeout: None,
        }
    }
}

/// Trait for implementing flow execution logic
#[async_trait]
pub trait Flow<S: StorageBackend>: Send + Sync {
    /// Register a node under a unique id
    fn add_node(&mut self, id: String, node: Box<dyn NodeRunner<S>>) -> Result<(), FlowError>;

    /// Add the edge `from --action--> to`
    fn add_route(&mut self, from: String, action: Action, to: String) -> Result<(), FlowError>;

    /// Run from `start_node_id` under a parent context (params, deadline, step budgets)
    async fn execute_with_context(
        &mut self,
        store: &mut SharedStore<S>,
        start_node_id: &str,
        parent: &ExecutionContext,
    ) -> Result<FlowExecutionResult, FlowError>;

    /// Execute the flow starting from the configured start node
    async fn execute(
        &mut self,
        store: &mut SharedStore<S>,
    ) -> Result<FlowExecutionResult, FlowError> {
        let start_node_id = self.config().start_node_id.clone();
        self.execute_from(store, start_node_id).await
    }

    /// Execute the flow starting from a specific node
    async fn execute_from(
        &mut self,
        store: &mut SharedStore<S>,
        start_node_id: String,
    ) -> Result<FlowExecutionResult, FlowError> {
        let context = ExecutionContext::new("flow");
        self.execute_with_context(store, &start_node_id, &context)
            .await
    }

    fn config(&self) -> &FlowConfig;

    fn set_config(&mut self, config: FlowConfig);

    /// Check the start node and every route endpoint exist
    fn validate(&self) -> Result<(), FlowError>;
}

/// Basic implementation of the Flow trait
pub struct BasicFlow<S: StorageBackend> {
    nodes: HashMap<String, Box<dyn NodeRunner<S>>>,
    routes: HashMap<String, HashMap<String, String>>,
    config: FlowConfig,
    params: Params,
}

impl<S: StorageBackend> BasicFlow<S> {
    pub fn new() -> Self {
        Self::with_config(FlowConfig::default())
    }

    pub fn with_config(config: FlowConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            routes: HashMap::new(),
            config,
            params: Params::new(),
        }
    }

    /// Params every node of this flow sees, unless the caller overrides them
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Destination of `(node_id, action)`, if that edge exists
    pub fn successor(&self, node_id: &str, action: &Action) -> Option<&str> {
        self.routes
            .get(node_id)
            .and_then(|edges| edges.get(action.name()))
            .map(String::as_str)
    }

    /// Nodes that no path from the start node reaches
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.config.start_node_id.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(edges) = self.routes.get(id) {
                queue.extend(edges.values().map(String::as_str));
            }
        }

        let mut unreachable: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        unreachable.sort();
        unreachable
    }
}

impl<S: StorageBackend> std::fmt::Debug for BasicFlow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node_ids: Vec<_> = self.nodes.keys().collect();
        node_ids.sort();
        f.debug_struct("BasicFlow")
            .field("nodes", &node_ids)
            .field("routes", &self.routes)
            .field("config", &self.config)
            .field("params", &self.params)
            .finish()
    }
}

impl<S: StorageBackend> Default for BasicFlow<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: StorageBackend> Flow<S> for BasicFlow<S> {
    fn add_node(&mut self, id: String, node: Box<dyn NodeRunner<S>>) -> Result<(), FlowError> {
        if self.nodes.contains_key(&id) {
            return Err(FlowError::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    fn add_route(&mut self, from: String, action: Action, to: String) -> Result<(), FlowError> {
        let edges = self.routes.entry(from.clone()).or_default();
        let label = action.name().to_string();
        if edges.contains_key(&label) {
            return Err(FlowError::DuplicateRoute {
                node_id: from,
                action: label,
            });
        }
        edges.insert(label, to);
        Ok(())
    }

    async fn execute_with_context(
        &mut self,
        store: &mut SharedStore<S>,
        start_node_id: &str,
        parent: &ExecutionContext,
    ) -> Result<FlowExecutionResult, FlowError> {
        if !self.nodes.contains_key(start_node_id) {
            return Err(FlowError::NodeNotFound(start_node_id.to_string()));
        }

        let params = self.params.merge(parent.params());
        let deadline = Deadline::earliest(
            parent.deadline(),
            self.config.timeout.map(Deadline::after),
        );
        let mut step_budgets = parent.step_budgets().to_vec();
        if let Some(max_steps) = self.config.max_steps {
            step_budgets.push(StepBudget::new(max_steps));
        }

        let mut current_node_id = start_node_id.to_string();
        let mut execution_path = Vec::new();
        let mut steps_executed = 0;

        loop {
            if let Some(spent) = step_budgets.iter().find(|budget| budget.is_exhausted()) {
                let max_steps = spent.limit();
                error!(node = %current_node_id, max_steps, "flow aborted: step limit reached");
                return Err(FlowError::MaxStepsExceeded(max_steps));
            }
            if let Some(deadline) = deadline.filter(Deadline::has_passed) {
                let limit = deadline.limit();
                error!(node = %current_node_id, ?limit, "flow aborted: timed out");
                return Err(FlowError::Timeout(limit));
            }

            let node = self
                .nodes
                .get_mut(&current_node_id)
                .ok_or_else(|| FlowError::NodeNotFound(current_node_id.clone()))?;

            execution_path.push(current_node_id.clone());
            step_budgets.iter().for_each(StepBudget::charge);
            let mut context = ExecutionContext::new(current_node_id.clone())
                .with_params(params.clone())
                .with_deadline(deadline);
            for budget in &step_budgets {
                context = context.with_step_budget(budget.clone());
            }

            let action = match node.invoke(store, context).await {
                Ok(action) => action,
                Err(failure) => {
                    error!(
                        node = %current_node_id,
                        phase = %failure.phase,
                        error = %failure,
                        "flow aborted: node failed"
                    );
                    return Err(FlowError::Node {
                        node_id: current_node_id,
                        failure,
                    });
                }
            };
            steps_executed += 1;

            match self.successor(&current_node_id, &action).map(str::to_string) {
                Some(next_node_id) => {
                    debug!(from = %current_node_id, action = %action, to = %next_node_id, "route");
                    current_node_id = next_node_id;
                }
                None => {
                    debug!(
                        node = %current_node_id,
                        action = %action,
                        steps_executed,
                        "flow finished"
                    );
                    return Ok(FlowExecutionResult {
                        final_action: action,
                        last_node_id: current_node_id,
                        steps_executed,
                        execution_path,
                    });
                }
            }
        }
    }

    fn config(&self) -> &FlowConfig {
        &self.config
    }

    fn set_config(&mut self, config: FlowConfig) {
        self.config = config;
    }

    fn validate(&self) -> Result<(), FlowError> {
        if !self.nodes.contains_key(&self.config.start_node_id) {
            return Err(FlowError::InvalidConfiguration(format!(
                "start node '{}' not found",
                self.config.start_node_id
            )));
        }

        for (from, edges) in &self.routes {
            if !self.nodes.contains_key(from) {
                return Err(FlowError::NodeNotFound(from.clone()));
            }
            if let Some(to) = edges.values().find(|to| !self.nodes.contains_key(*to)) {
                return Err(FlowError::NodeNotFound(to.clone()));
            }
        }

        Ok(())
    }
}

/// Builder for creating flows easily
pub struct FlowBuilder<S: StorageBackend> {
    nodes: Vec<(String, Box<dyn NodeRunner<S>>)>,
    routes: Vec<(String, Action, String)>,
    config: FlowConfig,
    params: Params,
}

impl<S: StorageBackend + 'static> Default for FlowBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StorageBackend + 'static> FlowBuilder<S> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            routes: Vec::new(),
            config: FlowConfig::default(),
            params: Params::new(),
        }
    }

    /// Set the starting node ID
    pub fn start_node(mut self, node_id: impl Into<String>) -> Self {
        self.config.start_node_id = node_id.into();
        self
    }

    /// Abort runs that execute more than `max_steps` nodes
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = Some(max_steps);
        self
    }

    /// Abort runs still going after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Register a node (a [`Node`](crate::Node), [`BatchNode`](crate::BatchNode),
    /// [`FlowNode`] or [`BatchFlow`])
    pub fn node(mut self, id: impl Into<String>, node: impl NodeRunner<S> + 'static) -> Self {
        self.nodes.push((id.into(), Box::new(node)));
        self
    }

    /// Add the edge `from --action--> to`
    pub fn route(
        mut self,
        from: impl Into<String>,
        action: impl Into<Action>,
        to: impl Into<String>,
    ) -> Self {
        self.routes.push((from.into(), action.into(), to.into()));
        self
    }

    /// Edge taken when `from` returns [`Action::none()`]
    pub fn default_route(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.route(from, Action::none(), to)
    }

    /// Assemble and validate the graph
    pub fn build(self) -> Result<BasicFlow<S>, FlowError> {
        let mut flow = BasicFlow::with_config(self.config).with_params(self.params);

        for (id, node) in self.nodes {
            flow.add_node(id, node)?;
        }
        for (from, action, to) in self.routes {
            flow.add_route(from, action, to)?;
        }
        flow.validate()?;

        for id in flow.unreachable_nodes() {
            warn!(
                node = %id,
                start = %flow.config.start_node_id,
                "node is unreachable from the start node"
            );
        }

        Ok(flow)
    }
}

/// A wrapper to make any Flow usable as a node of a larger flow.
///
/// The sub-flow runs against the parent's store and inherits its params and
/// run guards. Its terminal action becomes the node's action.
pub struct FlowNode<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    flow: F,
    name: String,
    _phantom: PhantomData<S>,
}

impl<F, S> FlowNode<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    pub fn new(flow: F) -> Self {
        Self {
            flow,
            name: "flow".to_string(),
            _phantom: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut F {
        &mut self.flow
    }

    pub fn into_inner(self) -> F {
        self.flow
    }
}

#[async_trait]
impl<F, S> NodeRunner<S> for FlowNode<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    async fn invoke(
        &mut self,
        store: &mut SharedStore<S>,
        context: ExecutionContext,
    ) -> Result<Action, NodeFailure> {
        let start_node_id = self.flow.config().start_node_id.clone();
        let result = self
            .flow
            .execute_with_context(store, &start_node_id, &context)
            .await
            .map_err(|e| NodeFailure::exec(e, 1))?;

        debug!(
            node = %context.node_id,
            last_node = %result.last_node_id,
            action = %result.final_action,
            "sub-flow finished"
        );
        Ok(result.final_action)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
