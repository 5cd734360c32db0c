//! LLM integration for buildloop.
//!
//! The self-fix loop only needs a chat-completion capability; this module
//! provides the [`LlmProvider`] seam and a LiteLLM/OpenAI-compatible client.
//!
//! ```ignore
//! use buildloop::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Fix this test")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Role,
    Usage,
};
