use std::sync::Arc;

use tracing::{Instrument, error, info, instrument, warn};

use crate::base::{
    prompts,
    types::{ChatMessage, Void},
};

use super::{
    Services,
    context::EventContext,
    pipeline::{Outcome, Pipeline},
    session::with_default_prompt,
};

/// Route one inbound message through the pipeline on its own task.
#[instrument(skip_all, fields(message_id = %event.message_id))]
pub fn handle_chat_event(event: EventContext, pipeline: Arc<Pipeline>, services: Services) {
    tokio::spawn(
        async move {
            // Process the event.
            let result = handle_chat_event_internal(&event, &pipeline, &services).await;

            // Log any errors.
            if let Err(err) = &result {
                error!("Error while handling: {}", err);
            }
        }
        .in_current_span(),
    );
}

/// Run the pipeline, falling back to the default completion when no stage handled the message.
pub async fn handle_chat_event_internal(event: &EventContext, pipeline: &Pipeline, services: &Services) -> Void {
    match pipeline.run(event).await {
        Outcome::Handled { stage } => {
            info!("Message handled by `{stage}`.");
            Ok(())
        }
        Outcome::Unhandled => complete_chat(event, services).await,
    }
}

/// The default chat flow: answer the message in the context of its session.
///
/// The session lock is held from reading the history until the answer is stored,
/// and nothing is stored when the completion fails.
#[instrument(skip_all)]
async fn complete_chat(event: &EventContext, services: &Services) -> Void {
    let Services { chat, llm, session, .. } = services;

    let _guard = session.lock(&event.session_id).await;

    let mut history = with_default_prompt(session.get_history(&event.session_id).await, &services.default_system_prompt);
    history.push(ChatMessage::user(event.parsed_text.clone()));

    let mode = session.get_mode(&event.session_id).await;

    info!("Completing {} messages in `{mode}` mode ...", history.len());

    match event.scope.run(llm.complete(&history, mode)).await {
        Ok(answer) => {
            let content = answer.content.clone();
            history.push(answer);
            session.set_history(&event.session_id, history).await;

            chat.send_reply(&event.conversation_id, &event.message_id, &content).await
        }
        Err(err) => {
            warn!("Completion failed: {err}");
            chat.send_reply(&event.conversation_id, &event.message_id, &prompts::completion_failed(&err)).await
        }
    }
}
