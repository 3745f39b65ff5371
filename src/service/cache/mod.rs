//! Caches shared by every pipeline run.
//!
//! - The dedup cache remembers which message ids were already processed, so that
//!   redeliveries of the same message are dropped.
//! - The session cache keeps each conversation's message history and response mode.

pub mod memory;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::base::types::{AiMode, ChatMessage};

// Types.

/// Exclusive access to one session, held across a read-modify-write of its history.
pub type SessionGuard = OwnedMutexGuard<()>;

// Traits.

/// Generic idempotency store keyed by message id.
#[async_trait]
pub trait GenericDedupCache: Send + Sync + 'static {
    /// Whether the message id was already processed.
    async fn is_processed(&self, message_id: &str) -> bool;

    /// Mark the message id as processed.
    async fn mark_processed(&self, message_id: &str);

    /// Atomically mark the message id as processed if it was not already.
    ///
    /// Returns `true` only for the caller that performed the transition, so
    /// concurrent redeliveries of one message observe exactly one `true`.
    async fn try_mark_processed(&self, message_id: &str) -> bool;
}

/// Generic per-session history and mode store.
///
/// Callers that read, modify, and write back a history must hold the guard
/// returned by [`GenericSessionCache::lock`] for the whole sequence.
#[async_trait]
pub trait GenericSessionCache: Send + Sync + 'static {
    /// Acquire exclusive access to a session. Distinct sessions never contend.
    async fn lock(&self, session_id: &str) -> SessionGuard;

    /// Get the session's history (empty for unknown sessions).
    async fn get_history(&self, session_id: &str) -> Vec<ChatMessage>;

    /// Replace the session's history.
    async fn set_history(&self, session_id: &str, history: Vec<ChatMessage>);

    /// Drop everything stored for the session.
    async fn clear(&self, session_id: &str);

    /// Get the session's response mode (the default for unknown sessions).
    async fn get_mode(&self, session_id: &str) -> AiMode;

    /// Set the session's response mode.
    async fn set_mode(&self, session_id: &str, mode: AiMode);
}

// Structs.

/// Dedup cache for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<dyn GenericDedupCache>,
}

impl Deref for DedupCache {
    type Target = dyn GenericDedupCache;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl DedupCache {
    pub fn new(inner: Arc<dyn GenericDedupCache>) -> Self {
        Self { inner }
    }
}

/// Session cache for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<dyn GenericSessionCache>,
}

impl Deref for SessionCache {
    type Target = dyn GenericSessionCache;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl SessionCache {
    pub fn new(inner: Arc<dyn GenericSessionCache>) -> Self {
        Self { inner }
    }
}
