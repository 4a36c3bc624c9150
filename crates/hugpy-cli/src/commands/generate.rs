use anyhow::{Context, Result};
use hugpy_core::{ChatMessage, GenerationRequest};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app;

pub fn run(
    name: &str,
    prompt: Option<String>,
    overrides: Vec<(String, Value)>,
    messages: Option<PathBuf>,
    timeout: Option<u64>,
) -> Result<()> {
    let request = match (prompt, messages) {
        (_, Some(path)) => GenerationRequest::Messages(read_messages(&path)?),
        (Some(prompt), None) => GenerationRequest::Prompt(prompt),
        (None, None) => anyhow::bail!("Provide a prompt or --messages FILE"),
    };
    let overrides: Map<String, Value> = overrides.into_iter().collect();

    let hub = app::load_hub()?;
    let text = match timeout {
        Some(secs) => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(hub.generate_with_timeout(
                name,
                request,
                overrides,
                Duration::from_secs(secs),
            ))
        }
        None => hub.generate_request(name, &request, &overrides),
    }
    .with_context(|| format!("Generation with '{}' failed", name))?;

    println!("{}", text);
    Ok(())
}

fn read_messages(path: &Path) -> Result<Vec<ChatMessage>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a list of chat messages", path.display()))?;
    if messages.is_empty() {
        anyhow::bail!("{} contains no messages", path.display());
    }
    Ok(messages)
}
