//! `CodeGenerator` trait — abstraction over the external script generator.
//!
//! The gateway owns the conversation log (an append-only `Vec<Message>`)
//! and passes it in by reference on every call; generators hold no
//! per-conversation state. Providers translate the shared message types
//! into their own wire format.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Generator response with usage metadata.
#[derive(Debug)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Abstraction over script-generating LLM backends.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Sends the conversation so far and returns the model's response.
    /// The response text is untrusted; the caller extracts and validates
    /// any code it contains.
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse>;

    /// Human-readable description of the provider and model.
    fn description(&self) -> String;
}

/// Extracts the single fenced python block from a model response.
///
/// The response is an untrusted string: only an explicit ` ```python …
/// ``` ` fence is accepted, and its absence is a generator error surfaced
/// to the retry loop, never a silent pass-through of the raw text.
pub fn extract_code_block(response: &str) -> Option<String> {
    let open = "```python";
    let start = response.find(open)?;
    let after_fence = &response[start + open.len()..];
    // The fence line may carry trailing spaces before the newline
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    let code = &body[..end];
    if code.trim().is_empty() {
        return None;
    }
    Some(code.to_string())
}
