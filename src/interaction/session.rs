//! History edits shared by the commands, the chat flow, and the card actions.
//!
//! Callers hold the session guard around these.

use crate::{
    base::types::{ChatMessage, Role},
    service::cache::SessionCache,
};

/// Prepend the default system prompt when the history has none.
pub fn with_default_prompt(mut history: Vec<ChatMessage>, default_prompt: &str) -> Vec<ChatMessage> {
    if !history.iter().any(|m| m.role == Role::System) {
        history.insert(0, ChatMessage::system(default_prompt.trim()));
    }

    history
}

/// Reset the session to a single system message.
pub async fn apply_system_prompt(session: &SessionCache, session_id: &str, prompt: &str) {
    session.clear(session_id).await;
    session.set_history(session_id, vec![ChatMessage::system(prompt)]).await;
}

// Tests.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::base::types::AiMode;

    #[test]
    fn test_with_default_prompt_only_when_missing() {
        let history = with_default_prompt(vec![ChatMessage::user("hi")], "be nice");

        assert_eq!(history, vec![ChatMessage::system("be nice"), ChatMessage::user("hi")]);

        let custom = vec![ChatMessage::system("be a pirate"), ChatMessage::user("hi")];

        assert_eq!(with_default_prompt(custom.clone(), "be nice"), custom);
    }

    #[tokio::test]
    async fn test_apply_system_prompt_replaces_history_and_mode() {
        let session = SessionCache::memory(Duration::from_secs(60));
        session.set_history("s1", vec![ChatMessage::user("old"), ChatMessage::assistant("older")]).await;
        session.set_mode("s1", AiMode::Creative).await;

        apply_system_prompt(&session, "s1", "You are a pirate.").await;

        assert_eq!(session.get_history("s1").await, vec![ChatMessage::system("You are a pirate.")]);
        assert_eq!(session.get_mode("s1").await, AiMode::Balanced);
    }
}
