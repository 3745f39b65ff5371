//! Runtime services and shared state for relay-bot.

use tracing::instrument;

use crate::{
    base::{
        config::Config,
        types::{Res, Void},
    },
    service::{
        cache::{DedupCache, SessionCache},
        chat::ChatClient,
        llm::LlmClient,
        roles::RoleCatalog,
    },
};

/// Runtime service context that can be shared across the application.
///
/// This struct holds the caches, the LLM and chat clients, the role list, and configuration.
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// The processed message ids.
    pub dedup: DedupCache,
    /// The per-session history and mode.
    pub session: SessionCache,
    /// The LLM client instance.
    pub llm: LlmClient,
    /// The built-in roles.
    pub roles: RoleCatalog,
    /// The chat client instance.
    pub chat: ChatClient,
}

impl Runtime {
    /// Create a new runtime instance.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> Res<Self> {
        // Initialize the caches.
        let dedup = DedupCache::memory(config.dedup_ttl);
        let session = SessionCache::memory(config.session_ttl);

        // Initialize the LLM client.
        let llm = LlmClient::openai(&config)?;

        // Load the role list.
        let roles = RoleCatalog::from_file(&config.roles_path)?;

        // Initialize the chat client.
        let chat = ChatClient::slack(&config, dedup.clone(), session.clone(), llm.clone(), roles.clone()).await?;

        Ok(Self {
            config,
            dedup,
            session,
            llm,
            roles,
            chat,
        })
    }

    pub async fn start(&self) -> Void {
        self.chat.start().await
    }
}
