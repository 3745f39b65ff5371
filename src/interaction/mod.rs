//! Event handling and user interactions for relay-bot.
//!
//! This module decides what happens to every inbound message:
//! - Gating (duplicate deliveries, messages not addressed to the bot, empty text)
//! - Built-in commands, each fully handled by its own stage
//! - The default chat completion flow for everything else
//! - Follow-up clicks on the cards the commands send

pub mod card_action;
pub mod chat_event;
pub mod commands;
pub mod context;
pub mod gating;
pub mod pipeline;
pub mod session;

use crate::service::{
    cache::{DedupCache, SessionCache},
    chat::ChatClient,
    llm::LlmClient,
    roles::RoleCatalog,
};

/// Collaborators handed to the stages and flows.
///
/// Every field is trivially cloneable.
#[derive(Clone)]
pub struct Services {
    pub chat: ChatClient,
    pub llm: LlmClient,
    pub dedup: DedupCache,
    pub session: SessionCache,
    pub roles: RoleCatalog,
    /// System prompt applied to sessions that never had one set.
    pub default_system_prompt: String,
}
