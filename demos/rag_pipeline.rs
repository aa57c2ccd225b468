//! Retrieval-augmented generation with the built-in collaborator nodes
//!
//! Offline flow: embed every document (parallel batch), then build the index.
//! Online flow: embed the question, fetch the closest document, and ask the
//! completion client to answer with it. Both collaborators are the
//! deterministic mocks, so the demo runs without network access.

use pocketgraph::prelude::*;
use pocketgraph::SearchHit;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DOCUMENTS: [&str; 5] = [
    "Pocket graphs wire small nodes together with action labels.",
    "Fine-tuning a model requires labelled training data and compute.",
    "A shared store lets every node read and write the same state.",
    "Vector indexes answer nearest-neighbour queries over embeddings.",
    "The weather in Lisbon is mild through most of the year.",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "How do nodes share state?".to_string());

    let embedder = Arc::new(HashEmbedder::default());
    let llm = Arc::new(MockCompletionClient::new("Answer"));

    let mut offline = FlowBuilder::new()
        .start_node("embed_documents")
        .node(
            "embed_documents",
            BatchNode::parallel(EmbedBatchNode::new(embedder.clone())),
        )
        .node("build_index", Node::new(BuildIndexNode::default()))
        .default_route("embed_documents", "build_index")
        .build()?;

    let mut online = FlowBuilder::new()
        .start_node("retrieve")
        .node(
            "retrieve",
            Node::new(SearchIndexNode::<_, FlatIndex>::new(embedder).with_action("retrieved")),
        )
        .node("prompt", Node::new(PromptNode))
        .node(
            "answer",
            Node::new(
                CompletionNode::new(llm, "prompt", "answer")
                    .with_retry(RetryPolicy::attempts(3))
                    .with_fallback("I could not reach the model."),
            ),
        )
        .route("retrieve", "retrieved", "prompt")
        .default_route("prompt", "answer")
        .build()?;

    let mut store = InMemorySharedStore::new();
    store.put("texts", DOCUMENTS)?;

    let runner = Runner::blocking();
    runner.run_async(&mut offline, &mut store).await?;
    println!("Indexed {} documents", DOCUMENTS.len());

    store.put("query", &question)?;
    runner.run_async(&mut online, &mut store).await?;

    let hits: Vec<SearchHit> = store.require("retrieved")?;
    for hit in &hits {
        println!("Retrieved #{} (distance {:.3}): {}", hit.index, hit.distance, hit.text);
    }
    println!("\nQ: {}", question);
    println!("A: {}", store.require::<String>("answer")?);

    Ok(())
}

/// Builds the completion prompt from the question and the retrieved document
struct PromptNode;

#[async_trait::async_trait]
impl NodeBackend<InMemoryStorage> for PromptNode {
    type PrepResult = (String, Vec<SearchHit>);
    type ExecResult = String;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<InMemoryStorage>,
        _context: &ExecutionContext,
    ) -> Result<Self::PrepResult, NodeError> {
        Ok((store.require("query")?, store.require("retrieved")?))
    }

    async fn exec(
        &self,
        input: Self::PrepResult,
        _context: &ExecutionContext,
    ) -> Result<String, NodeError> {
        let (query, hits) = input;
        let context = hits
            .iter()
            .map(|hit| hit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!(
            "Briefly answer the question using the context.\nQuestion: {}\nContext: {}",
            query, context
        ))
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<InMemoryStorage>,
        _input: Self::PrepResult,
        prompt: String,
        _context: &ExecutionContext,
    ) -> Result<Action, NodeError> {
        store.put("prompt", prompt)?;
        Ok(Action::none())
    }

    fn name(&self) -> &str {
        "PromptNode"
    }
}
