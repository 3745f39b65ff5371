//! Follow-up clicks on the cards sent by the commands.

use tracing::{Instrument, error, info, instrument};

use crate::{
    base::{prompts, types::Void},
    service::chat::{Card, CardAction},
};

use super::{Services, session::apply_system_prompt};

/// Handle a card button click on its own task.
#[instrument(skip_all)]
pub fn handle_card_action(action: CardAction, conversation_id: String, message_id: String, services: Services) {
    tokio::spawn(
        async move {
            // Process the action.
            let result = handle_card_action_internal(&action, &conversation_id, &message_id, &services).await;

            // Log any errors.
            if let Err(err) = &result {
                error!("Error while handling card action: {}", err);
            }
        }
        .in_current_span(),
    );
}

pub async fn handle_card_action_internal(action: &CardAction, conversation_id: &str, message_id: &str, services: &Services) -> Void {
    let Services { chat, session, roles, .. } = services;

    info!("Handling card action {action:?} ...");

    match action {
        CardAction::ClearConfirm { session_id } => {
            {
                let _guard = session.lock(session_id).await;
                session.clear(session_id).await;
            }

            chat.send_card(conversation_id, message_id, &notice(prompts::SESSION_CLEARED)).await
        }
        CardAction::ClearCancel { .. } => chat.send_card(conversation_id, message_id, &notice(prompts::SESSION_KEPT)).await,
        CardAction::SelectAiMode { session_id, mode } => {
            session.set_mode(session_id, *mode).await;

            chat.send_card(conversation_id, message_id, &notice(&prompts::mode_selected(mode.as_str()))).await
        }
        CardAction::SelectRoleTag { session_id, tag } => {
            let card = Card::Roles {
                session_id: session_id.clone(),
                tag: tag.clone(),
                roles: roles.roles_by_tag(tag),
            };

            chat.send_card(conversation_id, message_id, &card).await
        }
        CardAction::SelectRole { session_id, tag, title } => {
            let Some(role) = roles.roles_by_tag(tag).into_iter().find(|role| &role.title == title) else {
                return chat.send_card(conversation_id, message_id, &notice(prompts::ROLE_NOT_FOUND)).await;
            };

            {
                let _guard = session.lock(session_id).await;
                apply_system_prompt(session, session_id, &role.content).await;
            }

            chat.send_card(conversation_id, message_id, &Card::SystemInstruction { instruction: role.content }).await
        }
    }
}

fn notice(text: &str) -> Card {
    Card::Notice { text: text.to_string() }
}
