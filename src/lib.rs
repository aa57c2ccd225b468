//! # pocketgraph
//!
//! A minimalist node-graph workflow engine.
//!
//! Work is modelled as a **Graph + Shared Store**:
//! - **Node**: a unit of work with three phases: `prep` reads the store,
//!   `exec` does the work, `post` writes results and returns an **Action**
//! - **Flow**: connects nodes through actions (labelled edges) and walks the
//!   graph until a node's action has no matching edge
//! - **Shared Store**: the one channel nodes use to exchange data during a run
//!
//! Batch nodes map `exec` over a list of items, sequentially or in parallel.
//! Flows nest: a [`FlowNode`] runs a whole flow as one node, a [`BatchFlow`]
//! runs it once per parameter set. The [`Runner`] drives a run either by
//! blocking the caller or inside an existing async runtime.
//!
//! ## Feature Architecture
//!
//! - `builtin-nodes` (default): LogNode, SetValueNode, TransformNode,
//!   ConditionalNode, DelayNode
//! - `builtin-llm`: completion/embedding/vector-index collaborator traits, the
//!   nodes wrapping them, and deterministic mocks
//! - `storage-file`: JSON snapshot storage backend
//! - `builtin`: all built-in components
//! - `full`: everything
//!
//! ## Example
//!
//! ```rust
//! use pocketgraph::prelude::*;
//! use serde_json::json;
//!
//! let mut store = InMemorySharedStore::new();
//! store.set("input".to_string(), json!("Hello, pocketgraph!")).unwrap();
//!
//! let action: Action = "continue".into();
//! assert_eq!(action.name(), "continue");
//! assert_eq!(Action::none().name(), "default");
//! ```
//!
//! Logging goes through `tracing`; install a subscriber (for example
//! `tracing-subscriber`'s `fmt` with an `EnvFilter`) to see node and route
//! events.

// ============================================================================
// CORE MODULES
// ============================================================================

pub mod action;
pub mod flow;
pub mod node;
pub mod params;
pub mod runner;
pub mod shared_store;
pub mod storage;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

pub use action::{Action, DEFAULT_ACTION};

pub use shared_store::{InMemorySharedStore, SharedStore, StoreError};

pub use storage::{InMemoryStorage, StorageBackend};

pub use params::{Params, ParamsBuilder};

pub use node::batch::{BatchMode, BatchNode, BatchNodeBackend};
pub use node::{
    Backoff, BoxError, Deadline, ExecutionContext, FunctionNode, InMemoryNode, Node, NodeBackend,
    NodeError, NodeFailure, NodeRunner, Phase, RetryPolicy, StepBudget,
};

pub use flow::{
    BasicFlow, BatchFlow, Flow, FlowBuilder, FlowConfig, FlowError, FlowExecutionResult, FlowNode,
};

pub use runner::{ExecutionMode, Runner, RunnerConfig};

// ============================================================================
// STORAGE BACKEND RE-EXPORTS (feature-gated)
// ============================================================================

/// File storage
#[cfg(feature = "storage-file")]
pub use storage::{FileStorage, FileStorageError};

// ============================================================================
// BUILTIN COMPONENTS RE-EXPORTS (feature-gated)
// ============================================================================

/// Basic builtin nodes
#[cfg(feature = "builtin-nodes")]
pub use node::builtin::{ConditionalNode, DelayNode, LogNode, SetValueNode, TransformNode};

/// LLM collaborator nodes
#[cfg(feature = "builtin-llm")]
pub use node::builtin::{
    BuildIndexNode, CompletionClient, CompletionNode, EmbedBatchNode, EmbeddingClient, FlatIndex,
    HashEmbedder, LlmError, MockCompletionClient, SearchHit, SearchIndexNode, VectorIndex,
};

// ============================================================================
// CONVENIENCE RE-EXPORTS
// ============================================================================

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        Action, BasicFlow, BatchFlow, BatchMode, BatchNode, BatchNodeBackend, Deadline,
        ExecutionContext, ExecutionMode, Flow, FlowBuilder, FlowConfig, FlowError,
        FlowExecutionResult, FlowNode, FunctionNode, InMemorySharedStore, InMemoryStorage, Node,
        NodeBackend, NodeError, NodeFailure, NodeRunner, Params, Phase, RetryPolicy, Runner,
        RunnerConfig, SharedStore, StepBudget, StorageBackend, StoreError,
    };

    #[cfg(feature = "storage-file")]
    pub use crate::storage::FileStorage;

    #[cfg(feature = "builtin-nodes")]
    pub use crate::node::builtin::{
        ConditionalNode, DelayNode, LogNode, SetValueNode, TransformNode,
    };

    #[cfg(feature = "builtin-llm")]
    pub use crate::node::builtin::{
        BuildIndexNode, CompletionClient, CompletionNode, EmbedBatchNode, EmbeddingClient,
        FlatIndex, HashEmbedder, MockCompletionClient, SearchIndexNode, VectorIndex,
    };

    pub use serde_json::Value as JsonValue;
}
