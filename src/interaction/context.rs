//! The per-event context every pipeline stage reads.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::base::types::Res;

/// Where a message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// One-to-one conversation with the bot; always addressed to it.
    DirectChat,
    /// Shared conversation; only addressed to the bot when it is mentioned.
    GroupChat,
}

/// Someone @-mentioned in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub user_id: String,
    pub name: Option<String>,
}

/// Bound and cancellation for the external calls made while handling one event.
///
/// Supplied by the caller. A call that times out or is cancelled resolves to an
/// error, so the stage takes its failure path instead of hanging.
#[derive(Debug, Clone)]
pub struct CallScope {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallScope {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, CancellationToken::new())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run an external call under this scope.
    pub async fn run<T, F>(&self, call: F) -> Res<T>
    where
        F: Future<Output = Res<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow::anyhow!("The request was cancelled.")),
            result = tokio::time::timeout(self.timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("The request timed out after {}s.", self.timeout.as_secs_f32())),
            },
        }
    }
}

/// Parsed fields of one inbound message.
///
/// Built once per delivery by the chat integration and only read afterwards.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub origin: Origin,
    /// Media type of the raw message (e.g., `text`, `file`).
    pub message_kind: String,
    /// Platform-assigned id; the idempotency key.
    pub message_id: String,
    /// Groups messages into one conversation; replies are addressed to it.
    pub conversation_id: String,
    /// Session cache key.
    pub session_id: String,
    /// Normalized text. May be empty.
    pub parsed_text: String,
    pub file_key: Option<String>,
    pub image_key: Option<String>,
    pub image_keys: Vec<String>,
    pub mentions: Vec<Mention>,
    pub scope: CallScope,
}

impl EventContext {
    /// A plain text message whose session is its conversation.
    pub fn text(origin: Origin, conversation_id: impl Into<String>, message_id: impl Into<String>, parsed_text: impl Into<String>, scope: CallScope) -> Self {
        let conversation_id = conversation_id.into();

        Self {
            origin,
            message_kind: "text".to_string(),
            message_id: message_id.into(),
            session_id: conversation_id.clone(),
            conversation_id,
            parsed_text: parsed_text.into(),
            file_key: None,
            image_key: None,
            image_keys: Vec::new(),
            mentions: Vec::new(),
            scope,
        }
    }

    pub fn with_mentions(mut self, mentions: Vec<Mention>) -> Self {
        self.mentions = mentions;
        self
    }

    /// Whether the given user is among the mentions.
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m.user_id == user_id)
    }
}

// Tests.
