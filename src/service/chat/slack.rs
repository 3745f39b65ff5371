//! Slack implementation of the chat client.
//!
//! Events arrive over socket mode. Message ids and conversation ids are derived from
//! Slack's channel and timestamps:
//! - message id: `{channel}:{ts}`
//! - conversation id: `{channel}:{thread root ts}` (replies are posted into that thread)
//!
//! Direct messages (`im` channels) are addressed to the bot; everything else must mention it.

use std::{ops::Deref, sync::Arc, time::Duration};

use async_trait::async_trait;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use slack_morphism::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    base::{
        config::Config,
        types::{Res, Void},
    },
    interaction::{
        self, Services,
        context::{CallScope, EventContext, Mention, Origin},
        pipeline::Pipeline,
    },
    service::{
        cache::{DedupCache, SessionCache},
        llm::LlmClient,
        roles::RoleCatalog,
    },
};

use super::{Card, CardAction, CardLayout, ChatClient, GenericChatClient};

// Type aliases.

type FullClient = slack_morphism::SlackClient<SlackClientHyperConnector<HttpsConnector<HttpConnector>>>;

/// Slack rejects actions blocks with more elements than this.
const MAX_BLOCK_ELEMENTS: usize = 25;

// Extra methods on `ChatClient` applied by the slack implementation.

impl ChatClient {
    /// Creates a new Slack chat client.
    pub async fn slack(config: &Config, dedup: DedupCache, session: SessionCache, llm: LlmClient, roles: RoleCatalog) -> Res<Self> {
        let client = SlackChatClient::new(config, dedup, session, llm, roles).await?;
        Ok(Self { inner: Arc::new(client) })
    }
}

impl From<SlackChatClient> for ChatClient {
    fn from(client: SlackChatClient) -> Self {
        Self { inner: Arc::new(client) }
    }
}

// Structs.

/// User state for the slack socket client.
struct SlackUserState {
    services: Services,
    pipeline: Arc<Pipeline>,
    bot_user_id: String,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

/// Slack client implementation.
#[derive(Clone)]
struct SlackChatClient {
    pub app_token: SlackApiToken,
    pub bot_token: SlackApiToken,
    pub bot_user_id: String,
    pub client: Arc<FullClient>,
    pub dedup: DedupCache,
    pub session: SessionCache,
    pub llm: LlmClient,
    pub roles: RoleCatalog,
    pub default_system_prompt: String,
    pub call_timeout: Duration,
    /// Parent of every event's cancellation token; cancelled when the listener stops.
    pub shutdown: CancellationToken,
}

impl Deref for SlackChatClient {
    type Target = FullClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl SlackChatClient {
    /// Create a new Slack chat client.
    #[instrument(name = "SlackChatClient::new", skip_all)]
    pub async fn new(config: &Config, dedup: DedupCache, session: SessionCache, llm: LlmClient, roles: RoleCatalog) -> Res<Self> {
        // Initialize tokens.

        let app_token = SlackApiToken::new(SlackApiTokenValue(config.slack_app_token.clone()));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.slack_bot_token.clone()));

        // Initialize the Slack client.

        let https_connector = HttpsConnector::<HttpConnector>::builder().with_native_roots()?.https_only().enable_all_versions().build();
        let connector = SlackClientHyperConnector::with_connector(https_connector);
        let client = Arc::new(slack_morphism::SlackClient::new(connector));

        // Get the bot's user ID.

        let slack_session = client.open_session(&bot_token);
        let bot_user = slack_session.auth_test().await?;
        let bot_user_id = bot_user.user_id.0;

        info!("Slack bot user ID: {}", bot_user_id);

        Ok(Self {
            app_token,
            bot_token,
            bot_user_id,
            client,
            dedup,
            session,
            llm,
            roles,
            default_system_prompt: config.default_system_prompt.clone(),
            call_timeout: config.call_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    async fn post_message(&self, conversation_id: &str, content: SlackMessageContent) -> Void {
        let (channel_id, thread_ts) = split_conversation_id(conversation_id)?;

        let request = SlackApiChatPostMessageRequest::new(SlackChannelId(channel_id.to_string()), content)
            .with_as_user(true)
            .with_thread_ts(SlackTs(thread_ts.to_string()))
            .with_link_names(true);

        let session = self.client.open_session(&self.bot_token);

        let _ = session.chat_post_message(&request).await.map_err(|e| anyhow::anyhow!("Failed to send message: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl GenericChatClient for SlackChatClient {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn start(&self) -> Void {
        // Wire the interaction layer to this client.

        let services = Services {
            chat: ChatClient::from(self.clone()),
            llm: self.llm.clone(),
            dedup: self.dedup.clone(),
            session: self.session.clone(),
            roles: self.roles.clone(),
            default_system_prompt: self.default_system_prompt.clone(),
        };

        let pipeline = Arc::new(Pipeline::standard(&services));

        info!("Pipeline stages: {}", pipeline.stage_names().join(" -> "));

        // Initialize the socket mode listener.

        let socket_mode_callbacks = SlackSocketModeListenerCallbacks::new()
            .with_interaction_events(handle_interaction_event)
            .with_push_events(handle_push_event);

        // Initialize the socket mode listener environment.

        let listener_environment = Arc::new(SlackClientEventsListenerEnvironment::new(self.client.clone()).with_user_state(SlackUserState {
            services,
            pipeline,
            bot_user_id: self.bot_user_id.clone(),
            call_timeout: self.call_timeout,
            shutdown: self.shutdown.clone(),
        }));

        let socket_mode_listener = Arc::new(SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment.clone(),
            socket_mode_callbacks,
        ));

        // Register an app token to listen for events,
        socket_mode_listener.listen_for(&self.app_token).await?;

        // Start WS connections calling Slack API to get WS url for the token,
        // and wait for Ctrl-C to shutdown.
        socket_mode_listener.serve().await;

        // Abort the external calls of events still in flight.
        self.shutdown.cancel();

        Ok(())
    }

    #[instrument(skip(self, card))]
    async fn send_card(&self, conversation_id: &str, message_id: &str, card: &Card) -> Void {
        let layout = card.layout();
        let content = SlackMessageContent::new().with_text(fallback_text(&layout)).with_blocks(render_blocks(&layout)?);

        self.post_message(conversation_id, content).await
    }

    #[instrument(skip(self, text))]
    async fn send_reply(&self, conversation_id: &str, message_id: &str, text: &str) -> Void {
        self.post_message(conversation_id, SlackMessageContent::new().with_text(text.to_string())).await
    }
}

// Socket mode listener callbacks for Slack.

/// Handles interaction events (card button clicks) from Slack.
#[instrument(skip_all)]
async fn handle_interaction_event(event: SlackInteractionEvent, _client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let SlackInteractionEvent::BlockActions(event) = event else {
        warn!("Received unhandled interaction event.");
        return Ok(());
    };

    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    let channel_id = event.channel.as_ref().map(|c| c.id.0.clone()).ok_or(anyhow::anyhow!("Failed to get channel ID"))?;
    let message = event.message.as_ref().ok_or(anyhow::anyhow!("Failed to get the card message"))?;

    let ts = &message.origin.ts.0;
    let root_ts = message.origin.thread_ts.as_ref().map(|t| &t.0).unwrap_or(ts);

    for action in event.actions.iter().flatten() {
        let Some(value) = action.value.as_deref() else {
            continue;
        };

        match CardAction::decode(value) {
            Ok(card_action) => interaction::card_action::handle_card_action(
                card_action,
                conversation_id(&channel_id, root_ts),
                message_id(&channel_id, ts),
                user_state.services.clone(),
            ),
            Err(err) => warn!("Ignoring unknown card action `{}`: {}", action.action_id.0, err),
        }
    }

    Ok(())
}

/// Handles push events from Slack.
#[instrument(skip_all)]
async fn handle_push_event(event_callback: SlackPushEventCallback, _client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let event = event_callback.event;
    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    let scope = CallScope::new(user_state.call_timeout, user_state.shutdown.child_token());

    let context = match event {
        SlackEventCallbackBody::Message(slack_message_event) => {
            info!("Received message event ...");

            // Never answer bots (including ourselves).
            if slack_message_event.sender.bot_id.is_some() {
                return Ok(());
            }

            // Edits, deletions, and other bookkeeping messages are not new messages.
            if slack_message_event.subtype.is_some() && !matches!(slack_message_event.subtype, Some(SlackMessageEventType::FileShare)) {
                return Ok(());
            }

            let channel_id = slack_message_event.origin.channel.as_ref().ok_or(anyhow::anyhow!("Failed to get channel ID"))?.0.to_owned();
            let origin = match slack_message_event.origin.channel_type.as_ref().map(|t| t.0.as_str()) {
                Some("im") => Origin::DirectChat,
                _ => Origin::GroupChat,
            };

            build_context(origin, &channel_id, &slack_message_event.origin, slack_message_event.content.as_ref(), scope)?
        }
        SlackEventCallbackBody::AppMention(slack_app_mention_event) => {
            info!("Received app mention event ...");

            let channel_id = slack_app_mention_event.channel.0.to_owned();

            build_context(Origin::GroupChat, &channel_id, &slack_app_mention_event.origin, Some(&slack_app_mention_event.content), scope)?
        }
        _ => {
            warn!("Received unhandled push event.");
            return Ok(());
        }
    };

    interaction::chat_event::handle_chat_event(context, user_state.pipeline.clone(), user_state.services.clone());

    Ok(())
}

// Helpers.

fn message_id(channel_id: &str, ts: &str) -> String {
    format!("{channel_id}:{ts}")
}

fn conversation_id(channel_id: &str, root_ts: &str) -> String {
    format!("{channel_id}:{root_ts}")
}

/// Split a conversation id back into the channel and the thread to reply in.
fn split_conversation_id(conversation_id: &str) -> Res<(&str, &str)> {
    conversation_id
        .split_once(':')
        .filter(|(channel, ts)| !channel.is_empty() && !ts.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Malformed conversation id `{conversation_id}`."))
}

/// Build the event context for a Slack message.
fn build_context(origin: Origin, channel_id: &str, message: &SlackMessageOrigin, content: Option<&SlackMessageContent>, scope: CallScope) -> Res<EventContext> {
    let ts = &message.ts.0;
    let root_ts = message.thread_ts.as_ref().map(|t| &t.0).unwrap_or(ts);

    let raw_text = content.and_then(|c| c.text.as_deref()).unwrap_or_default();
    let (text, mentions) = normalize_text(raw_text);

    let mut context = EventContext::text(origin, conversation_id(channel_id, root_ts), message_id(channel_id, ts), text, scope).with_mentions(mentions);

    // Attachments.

    let files = content.and_then(|c| c.files.as_ref()).map(|files| files.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()).transpose()?.unwrap_or_default();

    for file in &files {
        let (Some(id), mimetype) = (file.get("id").and_then(|v| v.as_str()), file.get("mimetype").and_then(|v| v.as_str()).unwrap_or_default()) else {
            continue;
        };

        if mimetype.starts_with("image/") {
            context.image_keys.push(id.to_string());
        } else if context.file_key.is_none() {
            context.file_key = Some(id.to_string());
        }
    }

    context.image_key = context.image_keys.first().cloned();
    context.message_kind = match (&context.image_key, &context.file_key) {
        (Some(_), _) => "image",
        (None, Some(_)) => "file",
        (None, None) => "text",
    }
    .to_string();

    Ok(context)
}

/// Strip user mentions (`<@U123>` or `<@U123|name>`) out of the text, returning them separately.
///
/// Line breaks and indentation inside the text are kept.
fn normalize_text(text: &str) -> (String, Vec<Mention>) {
    let mut mentions = Vec::new();
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<@") {
        let Some(end) = rest[start..].find('>') else {
            break;
        };

        output.push_str(&rest[..start]);

        let token = &rest[start + 2..start + end];
        let (user_id, name) = match token.split_once('|') {
            Some((user_id, name)) => (user_id, Some(name.to_string())),
            None => (token, None),
        };

        mentions.push(Mention { user_id: user_id.to_string(), name });
        rest = &rest[start + end + 1..];

        // Drop the space that separated the token, so no double space is left behind.
        if output.is_empty() || output.ends_with(char::is_whitespace) {
            rest = rest.strip_prefix(' ').unwrap_or(rest);
        }
    }

    output.push_str(rest);

    (output.trim().to_string(), mentions)
}

/// Plain-text rendering of a card, shown in notifications.
fn fallback_text(layout: &CardLayout) -> String {
    match &layout.title {
        Some(title) => format!("{title}\n{}", layout.body),
        None => layout.body.clone(),
    }
}

/// Render a card layout as Block Kit blocks.
fn render_blocks(layout: &CardLayout) -> Res<Vec<SlackBlock>> {
    let mut blocks = Vec::new();

    if let Some(title) = &layout.title {
        blocks.push(SlackBlock::Header(SlackHeaderBlock::new(SlackBlockPlainTextOnly::from(SlackBlockPlainText::new(title.clone())))));
    }

    blocks.push(SlackBlock::Section(SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(SlackBlockMarkDownText::new(layout.body.clone())))));

    for (chunk, buttons) in layout.buttons.chunks(MAX_BLOCK_ELEMENTS).enumerate() {
        let elements = buttons
            .iter()
            .enumerate()
            .map(|(offset, button)| {
                let index = chunk * MAX_BLOCK_ELEMENTS + offset;
                let element = SlackBlockButtonElement::new(SlackBlockPlainTextOnly::from(SlackBlockPlainText::new(button.label.clone())))
                    .with_action_id(SlackActionId(format!("card_button_{index}")))
                    .with_value(button.action.encode()?);

                let element = if button.primary { element.with_style(SlackBlockButtonStyle::Primary) } else { element };

                Ok(SlackActionBlockElement::Button(element))
            })
            .collect::<Res<Vec<_>>>()?;

        blocks.push(SlackBlock::Actions(SlackActionsBlock::new(elements)));
    }

    Ok(blocks)
}

// Tests.
