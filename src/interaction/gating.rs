//! Stages that decide whether a message is processed at all.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::service::cache::DedupCache;

use super::{
    context::{EventContext, Origin},
    pipeline::{Flow, Stage},
};

/// Drops redeliveries of a message that was already processed.
pub struct DedupStage {
    dedup: DedupCache,
}

impl DedupStage {
    pub fn new(dedup: DedupCache) -> Self {
        Self { dedup }
    }
}

#[async_trait]
impl Stage for DedupStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn evaluate(&self, event: &EventContext) -> Flow {
        if self.dedup.try_mark_processed(&event.message_id).await {
            Flow::Continue
        } else {
            debug!("Dropping duplicate delivery of `{}`.", event.message_id);
            Flow::Stop
        }
    }
}

/// Drops group messages that do not mention the bot.
pub struct MentionStage {
    bot_user_id: String,
}

impl MentionStage {
    pub fn new(bot_user_id: &str) -> Self {
        Self {
            bot_user_id: bot_user_id.to_string(),
        }
    }
}

#[async_trait]
impl Stage for MentionStage {
    fn name(&self) -> &'static str {
        "mention"
    }

    async fn evaluate(&self, event: &EventContext) -> Flow {
        match event.origin {
            Origin::DirectChat => Flow::Continue,
            Origin::GroupChat if event.mentions_user(&self.bot_user_id) => Flow::Continue,
            Origin::GroupChat => Flow::Stop,
        }
    }
}

/// Drops messages without text (e.g., a bare file upload).
pub struct EmptyTextStage;

#[async_trait]
impl Stage for EmptyTextStage {
    fn name(&self) -> &'static str {
        "empty_text"
    }

    async fn evaluate(&self, event: &EventContext) -> Flow {
        if event.parsed_text.trim().is_empty() {
            info!(message_id = %event.message_id, message_kind = %event.message_kind, "Message text is empty.");
            return Flow::Stop;
        }

        Flow::Continue
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::interaction::context::{CallScope, Mention};

    fn event(origin: Origin, text: &str) -> EventContext {
        EventContext::text(origin, "C1", "m1", text, CallScope::with_timeout(Duration::from_secs(1)))
    }

    fn mention(user_id: &str) -> Mention {
        Mention {
            user_id: user_id.to_string(),
            name: None,
        }
    }

    #[tokio::test]
    async fn test_dedup_stage_stops_second_delivery() {
        let stage = DedupStage::new(DedupCache::memory(Duration::from_secs(60)));
        let event = event(Origin::DirectChat, "hi");

        assert_eq!(stage.evaluate(&event).await, Flow::Continue);
        assert_eq!(stage.evaluate(&event).await, Flow::Stop);
    }

    #[tokio::test]
    async fn test_mention_stage_direct_chat_always_continues() {
        let stage = MentionStage::new("UBOT");

        assert_eq!(stage.evaluate(&event(Origin::DirectChat, "hi")).await, Flow::Continue);
        assert_eq!(stage.evaluate(&event(Origin::DirectChat, "hi").with_mentions(vec![mention("UOTHER")])).await, Flow::Continue);
    }

    #[tokio::test]
    async fn test_mention_stage_group_chat_requires_bot_mention() {
        let stage = MentionStage::new("UBOT");

        assert_eq!(stage.evaluate(&event(Origin::GroupChat, "hi")).await, Flow::Stop);
        assert_eq!(stage.evaluate(&event(Origin::GroupChat, "hi").with_mentions(vec![mention("UOTHER")])).await, Flow::Stop);
        assert_eq!(
            stage.evaluate(&event(Origin::GroupChat, "hi").with_mentions(vec![mention("UOTHER"), mention("UBOT")])).await,
            Flow::Continue
        );
    }

    #[tokio::test]
    async fn test_empty_text_stage() {
        assert_eq!(EmptyTextStage.evaluate(&event(Origin::DirectChat, "")).await, Flow::Stop);
        assert_eq!(EmptyTextStage.evaluate(&event(Origin::DirectChat, " \n\t")).await, Flow::Stop);
        assert_eq!(EmptyTextStage.evaluate(&event(Origin::DirectChat, "hi")).await, Flow::Continue);
    }
}
