//! Service integrations for external APIs and clients.
//!
//! This module contains implementations for the services used by relay-bot:
//! - Caches (message dedup, per-session history and mode)
//! - Chat services (e.g., Slack)
//! - LLM services (e.g., OpenAI)
//! - The built-in role list
//!
//! Each service module defines both generic traits and concrete implementations,
//! allowing for extensibility and easy testing.

pub mod cache;
pub mod chat;
pub mod llm;
pub mod roles;
