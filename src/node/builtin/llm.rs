//! LLM collaborators and the nodes that wrap them.
//!
//! The engine never talks to a model provider itself. Completion, embedding
//! and vector search are traits; the nodes here call them from their exec
//! phase and move data through the store. [`MockCompletionClient`],
//! [`HashEmbedder`] and [`FlatIndex`] are deterministic in-process stand-ins.

use crate::node::batch::BatchNodeBackend;
use crate::node::{ExecutionContext, NodeBackend, NodeError, RetryPolicy};
use crate::{Action, SharedStore, StorageBackend};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Request(String),

    #[error("vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index is empty")]
    EmptyIndex,
}

impl From<LlmError> for NodeError {
    fn from(err: LlmError) -> Self {
        NodeError::ExecutionError(err.to_string())
    }
}

/// Text completion
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Text embedding
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// Nearest-neighbour search over embedding vectors.
///
/// Ids are insertion positions, so they line up with the texts the vectors
/// were computed from.
pub trait VectorIndex: Send + Sync {
    fn add(&mut self, vectors: Vec<Vec<f32>>) -> Result<(), LlmError>;

    /// Up to `k` `(id, distance)` pairs, closest first
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, LlmError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brute-force index ranking by squared L2 distance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: Option<usize>,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, vectors: Vec<Vec<f32>>) -> Result<(), LlmError> {
        for vector in vectors {
            let expected = *self.dimension.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(LlmError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            self.vectors.push(vector);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, LlmError> {
        let expected = self.dimension.ok_or(LlmError::EmptyIndex)?;
        if query.len() != expected {
            return Err(LlmError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }

        let mut hits: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(id, vector)| (id, squared_l2(query, vector)))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

/// Scripted completion client.
///
/// Answers `"{reply}: {prompt}"`. The first `fail_first` calls fail, which
/// is handy for exercising retry policies.
#[derive(Debug, Default)]
pub struct MockCompletionClient {
    reply: String,
    fail_first: usize,
    calls: AtomicUsize,
}

impl MockCompletionClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Self::default()
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Number of `complete` calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(LlmError::Request(format!("mock failure on call {}", call + 1)));
        }
        Ok(format!("{}: {}", self.reply, prompt))
    }
}

/// Bag-of-words embedder: each lowercase word is hashed into one of
/// `dimension` buckets, then the vector is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, word: &str) -> usize {
        // FNV-1a
        let hash = word.bytes().fold(0xcbf29ce484222325u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x100000001b3)
        });
        (hash % self.dimension as u64) as usize
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            vector[self.bucket(&word.to_lowercase())] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(self.embed_text(text))
    }
}

/// Reads a prompt string, asks the completion client, writes the reply.
pub struct CompletionNode<C: CompletionClient> {
    client: Arc<C>,
    prompt_key: String,
    output_key: String,
    action: Action,
    fallback: Option<String>,
    retry: RetryPolicy,
}

impl<C: CompletionClient> CompletionNode<C> {
    pub fn new(
        client: Arc<C>,
        prompt_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            prompt_key: prompt_key.into(),
            output_key: output_key.into(),
            action: Action::none(),
            fallback: None,
            retry: RetryPolicy::NONE,
        }
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_retry(mut self, policy: impl Into<RetryPolicy>) -> Self {
        self.retry = policy.into();
        self
    }

    /// Reply used when every attempt failed
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }
}

#[async_trait]
impl<C, S> NodeBackend<S> for CompletionNode<C>
where
    C: CompletionClient,
    S: StorageBackend,
{
    type PrepResult = String;
    type ExecResult = String;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<S>,
        _context: &ExecutionContext,
    ) -> Result<Self::PrepResult, Self::Error> {
        Ok(store.require(&self.prompt_key)?)
    }

    async fn exec(
        &self,
        prompt: Self::PrepResult,
        _context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        Ok(self.client.complete(&prompt).await?)
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        _prompt: Self::PrepResult,
        reply: Self::ExecResult,
        _context: &ExecutionContext,
    ) -> Result<Action, Self::Error> {
        store.put(self.output_key.as_str(), reply)?;
        Ok(self.action.clone())
    }

    async fn exec_fallback(
        &self,
        _prompt: Self::PrepResult,
        error: Self::Error,
        _context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        self.fallback.clone().ok_or(error)
    }

    fn name(&self) -> &str {
        "CompletionNode"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Batch node embedding every text under `texts_key` into `embeddings_key`.
///
/// Usually run in parallel mode, since each item is an independent call.
pub struct EmbedBatchNode<E: EmbeddingClient> {
    client: Arc<E>,
    texts_key: String,
    embeddings_key: String,
    action: Action,
}

impl<E: EmbeddingClient> EmbedBatchNode<E> {
    pub fn new(client: Arc<E>) -> Self {
        Self {
            client,
            texts_key: "texts".to_string(),
            embeddings_key: "embeddings".to_string(),
            action: Action::none(),
        }
    }

    pub fn with_keys(
        mut self,
        texts_key: impl Into<String>,
        embeddings_key: impl Into<String>,
    ) -> Self {
        self.texts_key = texts_key.into();
        self.embeddings_key = embeddings_key.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }
}

#[async_trait]
impl<E, S> BatchNodeBackend<S> for EmbedBatchNode<E>
where
    E: EmbeddingClient,
    S: StorageBackend,
{
    type Item = String;
    type Output = Vec<f32>;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<S>,
        _context: &ExecutionContext,
    ) -> Result<Vec<String>, Self::Error> {
        Ok(store.require(&self.texts_key)?)
    }

    async fn exec(
        &self,
        text: String,
        _context: &ExecutionContext,
    ) -> Result<Vec<f32>, Self::Error> {
        Ok(self.client.embed(&text).await?)
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        _texts: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        context: &ExecutionContext,
    ) -> Result<Action, Self::Error> {
        tracing::debug!(node = %context.node_id, count = embeddings.len(), "embeddings stored");
        store.put(self.embeddings_key.as_str(), embeddings)?;
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "EmbedBatchNode"
    }
}

/// Builds an index from the vectors under `embeddings_key` and stores it,
/// serialized, under `index_key`.
pub struct BuildIndexNode<I = FlatIndex> {
    embeddings_key: String,
    index_key: String,
    action: Action,
    _index: PhantomData<fn() -> I>,
}

impl<I> BuildIndexNode<I> {
    pub fn new(embeddings_key: impl Into<String>, index_key: impl Into<String>) -> Self {
        Self {
            embeddings_key: embeddings_key.into(),
            index_key: index_key.into(),
            action: Action::none(),
            _index: PhantomData,
        }
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }
}

impl Default for BuildIndexNode<FlatIndex> {
    fn default() -> Self {
        Self::new("embeddings", "index")
    }
}

#[async_trait]
impl<I, S> NodeBackend<S> for BuildIndexNode<I>
where
    I: VectorIndex + Default + Serialize + 'static,
    S: StorageBackend,
{
    type PrepResult = Vec<Vec<f32>>;
    type ExecResult = I;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<S>,
        _context: &ExecutionContext,
    ) -> Result<Self::PrepResult, Self::Error> {
        Ok(store.require(&self.embeddings_key)?)
    }

    async fn exec(
        &self,
        embeddings: Self::PrepResult,
        _context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        let mut index = I::default();
        index.add(embeddings)?;
        Ok(index)
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        _embeddings: Self::PrepResult,
        index: Self::ExecResult,
        context: &ExecutionContext,
    ) -> Result<Action, Self::Error> {
        tracing::debug!(node = %context.node_id, vectors = index.len(), "index built");
        store.put(self.index_key.as_str(), &index)?;
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "BuildIndexNode"
    }
}

/// One retrieved document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: usize,
    pub text: String,
    pub distance: f32,
}

/// Embeds the query, searches the stored index and writes the closest
/// texts as [`SearchHit`]s.
pub struct SearchIndexNode<E: EmbeddingClient, I = FlatIndex> {
    client: Arc<E>,
    query_key: String,
    index_key: String,
    texts_key: String,
    output_key: String,
    top_k: usize,
    action: Action,
    _index: PhantomData<fn() -> I>,
}

impl<E: EmbeddingClient, I> SearchIndexNode<E, I> {
    /// Reads `query`, `index` and `texts`; writes `retrieved`
    pub fn new(client: Arc<E>) -> Self {
        Self {
            client,
            query_key: "query".to_string(),
            index_key: "index".to_string(),
            texts_key: "texts".to_string(),
            output_key: "retrieved".to_string(),
            top_k: 1,
            action: Action::none(),
            _index: PhantomData,
        }
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }
}

/// Inputs gathered by [`SearchIndexNode`]'s prep phase
pub struct SearchInput<I> {
    query: String,
    index: Arc<I>,
    texts: Arc<Vec<String>>,
}

impl<I> Clone for SearchInput<I> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            index: Arc::clone(&self.index),
            texts: Arc::clone(&self.texts),
        }
    }
}

#[async_trait]
impl<E, I, S> NodeBackend<S> for SearchIndexNode<E, I>
where
    E: EmbeddingClient,
    I: VectorIndex + DeserializeOwned + 'static,
    S: StorageBackend,
{
    type PrepResult = SearchInput<I>;
    type ExecResult = Vec<SearchHit>;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<S>,
        _context: &ExecutionContext,
    ) -> Result<Self::PrepResult, Self::Error> {
        Ok(SearchInput {
            query: store.require(&self.query_key)?,
            index: Arc::new(store.require(&self.index_key)?),
            texts: Arc::new(store.require(&self.texts_key)?),
        })
    }

    async fn exec(
        &self,
        input: Self::PrepResult,
        _context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        let query = self.client.embed(&input.query).await?;
        input
            .index
            .search(&query, self.top_k)?
            .into_iter()
            .map(|(id, distance)| {
                let text = input.texts.get(id).cloned().ok_or_else(|| {
                    NodeError::ValidationError(format!("index entry {} has no matching text", id))
                })?;
                Ok(SearchHit {
                    index: id,
                    text,
                    distance,
                })
            })
            .collect()
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        _input: Self::PrepResult,
        hits: Self::ExecResult,
        _context: &ExecutionContext,
    ) -> Result<Action, Self::Error> {
        store.put(self.output_key.as_str(), hits)?;
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "SearchIndexNode"
    }
}
