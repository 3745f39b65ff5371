//! Library root for `relay-bot`.
//!
//! Relay-bot is an OpenAI-powered assistant for team chats. Every inbound message
//! runs through a pipeline of stages:
//! - Gating drops redeliveries, messages not addressed to the bot, and empty text
//! - Built-in commands clear or re-prompt the session, switch the response mode,
//!   browse built-in roles, query the API balance, or summarize a web page
//! - Anything else is answered with a chat completion in the context of its session
//!
//! The bot integrates with Slack for chat and OpenAI for completions. The architecture
//! is built around extensible traits that allow for different implementations of each service.

pub mod base;
pub mod interaction;
pub mod runtime;
pub mod service;

use base::{config::Config, types::Void};
use rustls::crypto;
use tracing::info;

/// Public async entry for the binary crate.
///
/// Sets up necessary services and starts the relay-bot runtime:
/// - Initializes the crypto provider
/// - Creates the runtime context with caches, LLM, role, and chat clients
/// - Starts the main event loop for processing messages
pub async fn start(config: Config) -> Void {
    info!("Starting relay-bot ...");

    // Start the crypto provider.
    crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install the default crypto provider."))?;

    // Initialize the runtime.
    let runtime = runtime::Runtime::new(config).await?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
