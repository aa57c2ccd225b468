//! Ready-made nodes, grouped by cargo feature:
//!
//! - `builtin-nodes`: [`LogNode`], [`SetValueNode`], [`TransformNode`],
//!   [`ConditionalNode`], [`DelayNode`]
//! - `builtin-llm`: completion, embedding and vector-index nodes plus
//!   deterministic in-process collaborators

// ============================================================================
// BASIC BUILTIN NODES (feature: builtin-nodes)
// ============================================================================

/// Small general-purpose nodes: logging, constants, transforms, branching, waiting
#[cfg(feature = "builtin-nodes")]
pub mod basic {
    use crate::node::{ExecutionContext, NodeBackend, NodeError};
    use crate::{Action, SharedStore, StorageBackend};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::marker::PhantomData;
    use std::time::Duration;

    /// Emits `message` as an info event, then returns its action.
    ///
    /// Touches nothing in the store.
    pub struct LogNode {
        message: String,
        action: Action,
    }

    impl LogNode {
        pub fn new(message: impl Into<String>, action: impl Into<Action>) -> Self {
            Self {
                message: message.into(),
                action: action.into(),
            }
        }
    }

    #[async_trait]
    impl<S: StorageBackend> NodeBackend<S> for LogNode {
        type PrepResult = ();
        type ExecResult = ();
        type Error = NodeError;

        async fn prep(&self, _: &SharedStore<S>, _: &ExecutionContext) -> Result<(), NodeError> {
            Ok(())
        }

        async fn exec(&self, _: (), context: &ExecutionContext) -> Result<(), NodeError> {
            tracing::info!(
                node = %context.node_id,
                execution_id = %context.execution_id,
                "{}",
                self.message
            );
            Ok(())
        }

        async fn post(
            &mut self,
            _: &mut SharedStore<S>,
            _: (),
            _: (),
            _: &ExecutionContext,
        ) -> Result<Action, NodeError> {
            Ok(self.action.clone())
        }

        fn name(&self) -> &str {
            "LogNode"
        }
    }

    /// Writes a constant under `key`
    pub struct SetValueNode {
        key: String,
        value: Value,
        action: Action,
    }

    impl SetValueNode {
        pub fn new(key: impl Into<String>, value: Value, action: impl Into<Action>) -> Self {
            Self {
                key: key.into(),
                value,
                action: action.into(),
            }
        }
    }

    #[async_trait]
    impl<S: StorageBackend> NodeBackend<S> for SetValueNode {
        type PrepResult = ();
        type ExecResult = Value;
        type Error = NodeError;

        async fn prep(&self, _: &SharedStore<S>, _: &ExecutionContext) -> Result<(), NodeError> {
            Ok(())
        }

        async fn exec(&self, _: (), _: &ExecutionContext) -> Result<Value, NodeError> {
            Ok(self.value.clone())
        }

        async fn post(
            &mut self,
            store: &mut SharedStore<S>,
            _: (),
            value: Value,
            _: &ExecutionContext,
        ) -> Result<Action, NodeError> {
            store.put(self.key.as_str(), value)?;
            Ok(self.action.clone())
        }

        fn name(&self) -> &str {
            "SetValueNode"
        }
    }

    /// Reads `input_key`, runs `transform` on it in exec, and writes the
    /// result under `output_key`.
    ///
    /// A missing input reaches the transform as `None`; rejecting it is the
    /// transform's call.
    pub struct TransformNode<F> {
        input_key: String,
        output_key: String,
        transform: F,
        action: Action,
    }

    impl<F> TransformNode<F>
    where
        F: Fn(Option<Value>) -> Result<Value, NodeError> + Send + Sync,
    {
        pub fn new(
            input_key: impl Into<String>,
            output_key: impl Into<String>,
            transform: F,
            action: impl Into<Action>,
        ) -> Self {
            Self {
                input_key: input_key.into(),
                output_key: output_key.into(),
                transform,
                action: action.into(),
            }
        }
    }

    #[async_trait]
    impl<S, F> NodeBackend<S> for TransformNode<F>
    where
        S: StorageBackend,
        F: Fn(Option<Value>) -> Result<Value, NodeError> + Send + Sync,
    {
        type PrepResult = Option<Value>;
        type ExecResult = Value;
        type Error = NodeError;

        async fn prep(
            &self,
            store: &SharedStore<S>,
            _: &ExecutionContext,
        ) -> Result<Option<Value>, NodeError> {
            store
                .get(&self.input_key)
                .map_err(|e| NodeError::StorageError(e.to_string()))
        }

        async fn exec(
            &self,
            input: Option<Value>,
            _: &ExecutionContext,
        ) -> Result<Value, NodeError> {
            (self.transform)(input)
        }

        async fn post(
            &mut self,
            store: &mut SharedStore<S>,
            _: Option<Value>,
            output: Value,
            _: &ExecutionContext,
        ) -> Result<Action, NodeError> {
            store.put(self.output_key.as_str(), output)?;
            Ok(self.action.clone())
        }

        fn name(&self) -> &str {
            "TransformNode"
        }
    }

    /// Branches on a predicate over the store: `if_true` or `if_false`
    pub struct ConditionalNode<F, S> {
        predicate: F,
        if_true: Action,
        if_false: Action,
        _storage: PhantomData<fn(&S)>,
    }

    impl<F, S> ConditionalNode<F, S>
    where
        F: Fn(&SharedStore<S>) -> bool + Send + Sync,
        S: StorageBackend,
    {
        pub fn new(predicate: F, if_true: impl Into<Action>, if_false: impl Into<Action>) -> Self {
            Self {
                predicate,
                if_true: if_true.into(),
                if_false: if_false.into(),
                _storage: PhantomData,
            }
        }
    }

    #[async_trait]
    impl<S, F> NodeBackend<S> for ConditionalNode<F, S>
    where
        S: StorageBackend,
        F: Fn(&SharedStore<S>) -> bool + Send + Sync,
    {
        type PrepResult = bool;
        type ExecResult = Action;
        type Error = NodeError;

        async fn prep(
            &self,
            store: &SharedStore<S>,
            _: &ExecutionContext,
        ) -> Result<bool, NodeError> {
            Ok((self.predicate)(store))
        }

        async fn exec(&self, holds: bool, _: &ExecutionContext) -> Result<Action, NodeError> {
            Ok(if holds {
                self.if_true.clone()
            } else {
                self.if_false.clone()
            })
        }

        async fn post(
            &mut self,
            _: &mut SharedStore<S>,
            _: bool,
            branch: Action,
            _: &ExecutionContext,
        ) -> Result<Action, NodeError> {
            Ok(branch)
        }

        fn name(&self) -> &str {
            "ConditionalNode"
        }
    }

    /// Sleeps for `duration` in exec
    pub struct DelayNode {
        duration: Duration,
        action: Action,
    }

    impl DelayNode {
        pub fn new(duration: Duration, action: impl Into<Action>) -> Self {
            Self {
                duration,
                action: action.into(),
            }
        }
    }

    #[async_trait]
    impl<S: StorageBackend> NodeBackend<S> for DelayNode {
        type PrepResult = ();
        type ExecResult = ();
        type Error = NodeError;

        async fn prep(&self, _: &SharedStore<S>, _: &ExecutionContext) -> Result<(), NodeError> {
            Ok(())
        }

        async fn exec(&self, _: (), _: &ExecutionContext) -> Result<(), NodeError> {
            tokio::time::sleep(self.duration).await;
            Ok(())
        }

        async fn post(
            &mut self,
            _: &mut SharedStore<S>,
            _: (),
            _: (),
            _: &ExecutionContext,
        ) -> Result<Action, NodeError> {
            Ok(self.action.clone())
        }

        fn name(&self) -> &str {
            "DelayNode"
        }
    }
}

// ============================================================================
// LLM NODES (feature: builtin-llm)
// ============================================================================

#[cfg(feature = "builtin-llm")]
pub mod llm;

// ============================================================================
// RE-EXPORTS FOR CONVENIENCE
// ============================================================================

#[cfg(feature = "builtin-nodes")]
pub use basic::{ConditionalNode, DelayNode, LogNode, SetValueNode, TransformNode};

#[cfg(feature = "builtin-llm")]
pub use llm::{
    BuildIndexNode, CompletionClient, CompletionNode, EmbedBatchNode, EmbeddingClient, FlatIndex,
    HashEmbedder, LlmError, MockCompletionClient, SearchHit, SearchIndexNode, VectorIndex,
};
