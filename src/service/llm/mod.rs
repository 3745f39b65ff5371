pub mod openai;

use crate::base::types::{AiMode, Balance, ChatMessage, Res};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;

// Traits.

/// Generic LLM client trait that clients must implement.
///
/// This trait defines the core functionality for interacting with large language models.
/// Implementing this trait allows different LLM providers to be used with the bot.
#[async_trait]
pub trait GenericLlmClient: Send + Sync + 'static {
    /// Query the remaining account credit.
    async fn get_balance(&self) -> Res<Balance>;

    /// Complete a conversation.
    ///
    /// The mode selects the sampling temperature. Returns the assistant message.
    async fn complete(&self, history: &[ChatMessage], mode: AiMode) -> Res<ChatMessage>;

    /// Complete a conversation, letting the model call tools (e.g., fetching a web page)
    /// before it answers.
    ///
    /// This is much slower than [`GenericLlmClient::complete`], since each tool round
    /// is a separate request.
    async fn complete_with_tools(&self, history: &[ChatMessage], mode: AiMode) -> Res<ChatMessage>;
}

// Structs.

/// LLM client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct LlmClient {
    inner: Arc<dyn GenericLlmClient>,
}

impl Deref for LlmClient {
    type Target = dyn GenericLlmClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl LlmClient {
    pub fn new(inner: Arc<dyn GenericLlmClient>) -> Self {
        Self { inner }
    }
}
