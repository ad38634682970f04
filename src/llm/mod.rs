pub mod anthropic;
pub mod client;

pub use anthropic::AnthropicClient;
pub use client::{CodeGenerator, LlmResponse, Message};
