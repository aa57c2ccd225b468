//! Sequential vs parallel batch nodes
//!
//! Each "translation" sleeps for a while. The sequential run takes the sum of
//! the delays, the parallel run roughly the longest one, and the throttled run
//! sits in between. Results always come back in input order.

use async_trait::async_trait;
use pocketgraph::prelude::*;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Pretends to translate a text into every language under `languages`
struct Translate;

#[async_trait]
impl BatchNodeBackend<InMemoryStorage> for Translate {
    type Item = String;
    type Output = String;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<InMemoryStorage>,
        _context: &ExecutionContext,
    ) -> Result<Vec<String>, NodeError> {
        Ok(store.require("languages")?)
    }

    async fn exec(
        &self,
        language: String,
        context: &ExecutionContext,
    ) -> Result<String, NodeError> {
        let delay = 40 + 20 * (language.len() as u64 % 4);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        tracing::debug!(item = ?context.item_index, %language, "translated");
        Ok(format!("[{}] Hello!", language))
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<InMemoryStorage>,
        _languages: Vec<String>,
        translations: Vec<String>,
        _context: &ExecutionContext,
    ) -> Result<Action, NodeError> {
        store.put("translations", translations)?;
        Ok(Action::none())
    }

    fn name(&self) -> &str {
        "Translate"
    }
}

async fn timed(
    label: &str,
    node: &mut BatchNode<Translate, InMemoryStorage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = InMemorySharedStore::new();
    store.put(
        "languages",
        [
            "Chinese",
            "Spanish",
            "Japanese",
            "German",
            "Russian",
            "Portuguese",
            "French",
            "Korean",
        ],
    )?;

    let start = Instant::now();
    node.run(&mut store).await?;
    let translations: Vec<String> = store.require("translations")?;

    println!("{:<22} {:>6.0?}  first: {}", label, start.elapsed(), translations[0]);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    timed("sequential", &mut BatchNode::new(Translate)).await?;
    timed("parallel", &mut BatchNode::parallel(Translate)).await?;
    timed(
        "parallel (max 3)",
        &mut BatchNode::new(Translate).with_max_in_flight(3),
    )
    .await?;

    Ok(())
}
