pub mod slack;

use std::{collections::BTreeSet, ops::Deref, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    base::{
        prompts,
        types::{AiMode, Balance, Res, Void},
    },
    service::roles::RoleEntry,
};

// Types.

/// Interactive card payloads the bot can send.
///
/// How a card is drawn is up to the chat platform implementation, which usually
/// starts from [`Card::layout`].
#[derive(Debug, Clone, PartialEq)]
pub enum Card {
    /// Asks the user to confirm clearing the session.
    ClearConfirm { session_id: String },
    /// Echoes a freshly set system prompt.
    SystemInstruction { instruction: String },
    /// Static command overview.
    Help,
    /// Remaining API credit.
    Balance(Balance),
    /// Role tags to browse.
    RoleTags { session_id: String, tags: BTreeSet<String> },
    /// Roles carrying one tag.
    Roles { session_id: String, tag: String, roles: Vec<RoleEntry> },
    /// Response modes to pick from.
    AiModes { session_id: String, modes: Vec<AiMode> },
    /// Developer diagnostics.
    DevTest { modes: Vec<AiMode>, generated_at: DateTime<Utc> },
    /// Plain notice, used to answer a card that was acted upon.
    Notice { text: String },
}

/// What a card button asks the bot to do.
///
/// Buttons carry their action serialized as JSON, so a click can be handled
/// without any state kept between the card and the click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CardAction {
    ClearConfirm { session_id: String },
    ClearCancel { session_id: String },
    SelectAiMode { session_id: String, mode: AiMode },
    SelectRoleTag { session_id: String, tag: String },
    SelectRole { session_id: String, tag: String, title: String },
}

impl CardAction {
    pub fn encode(&self) -> Res<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(value: &str) -> Res<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// A button on a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardButton {
    pub label: String,
    pub action: CardAction,
    pub primary: bool,
}

/// Platform-neutral layout of a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLayout {
    pub title: Option<String>,
    pub body: String,
    pub buttons: Vec<CardButton>,
}

impl Card {
    pub fn layout(&self) -> CardLayout {
        match self {
            Card::ClearConfirm { session_id } => CardLayout {
                title: Some("🆑 机器人提醒".to_string()),
                body: "您确定要清除对话上下文吗？\n请注意，这将开始一个全新的对话，您将无法利用之前话题的历史信息".to_string(),
                buttons: vec![
                    CardButton {
                        label: "确认清除".to_string(),
                        action: CardAction::ClearConfirm { session_id: session_id.clone() },
                        primary: true,
                    },
                    CardButton {
                        label: "我再想想".to_string(),
                        action: CardAction::ClearCancel { session_id: session_id.clone() },
                        primary: false,
                    },
                ],
            },
            Card::SystemInstruction { instruction } => CardLayout {
                title: Some("🥷 已进入角色扮演模式".to_string()),
                body: format!("{instruction}\n\n_对话上下文已重置_"),
                buttons: Vec::new(),
            },
            Card::Help => CardLayout {
                title: Some("🎒 需要帮助吗？".to_string()),
                body: prompts::HELP_TEXT.trim().to_string(),
                buttons: Vec::new(),
            },
            Card::Balance(balance) => {
                let mut body = format!(
                    "总额度: {:.2}$\n已用额度: {:.2}$\n可用额度: {:.2}$",
                    balance.total_granted, balance.total_used, balance.total_available
                );

                if let (Some(from), Some(to)) = (balance.effective_at, balance.expires_at) {
                    body.push_str(&format!("\n有效期: {} - {}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d")));
                }

                CardLayout {
                    title: Some("🎰 余额查询".to_string()),
                    body,
                    buttons: Vec::new(),
                }
            }
            Card::RoleTags { session_id, tags } => CardLayout {
                title: Some("🛖 角色列表".to_string()),
                body: if tags.is_empty() { "暂无可用角色".to_string() } else { "请选择角色类别".to_string() },
                buttons: tags
                    .iter()
                    .map(|tag| CardButton {
                        label: tag.clone(),
                        action: CardAction::SelectRoleTag {
                            session_id: session_id.clone(),
                            tag: tag.clone(),
                        },
                        primary: false,
                    })
                    .collect(),
            },
            Card::Roles { session_id, tag, roles } => CardLayout {
                title: Some(format!("🛖 `{tag}`")),
                body: if roles.is_empty() { "该类别下暂无角色".to_string() } else { "请选择角色，将以该角色开始新的对话".to_string() },
                buttons: roles
                    .iter()
                    .map(|role| CardButton {
                        label: role.title.clone(),
                        action: CardAction::SelectRole {
                            session_id: session_id.clone(),
                            tag: tag.clone(),
                            title: role.title.clone(),
                        },
                        primary: false,
                    })
                    .collect(),
            },
            Card::AiModes { session_id, modes } => CardLayout {
                title: Some("🤖 发散模式选择".to_string()),
                body: "请选择回复风格：精确更严谨，创意更发散".to_string(),
                buttons: modes
                    .iter()
                    .map(|mode| CardButton {
                        label: mode.to_string(),
                        action: CardAction::SelectAiMode {
                            session_id: session_id.clone(),
                            mode: *mode,
                        },
                        primary: *mode == AiMode::default(),
                    })
                    .collect(),
            },
            Card::DevTest { modes, generated_at } => CardLayout {
                title: Some("🛠 开发模式".to_string()),
                body: format!(
                    "*bold* _italic_ ~strike~ `code`\n> quote\n• list item\n\nmodes: {}\ngenerated at: {}",
                    modes.iter().map(|m| format!("`{m}` ({:.1})", m.temperature())).collect::<Vec<_>>().join(", "),
                    generated_at.to_rfc3339()
                ),
                buttons: Vec::new(),
            },
            Card::Notice { text } => CardLayout {
                title: None,
                body: text.clone(),
                buttons: Vec::new(),
            },
        }
    }
}

// Traits.

/// Generic "chat" trait that clients must implement.
///
/// This trait defines the outbound operations the bot needs from a chat platform.
/// Implementing this trait allows different chat services to be used with the bot.
#[async_trait]
pub trait GenericChatClient: Send + Sync + 'static {
    /// Get the bot user ID.
    ///
    /// Returns the unique identifier for the bot in the chat platform,
    /// which is used to detect when the bot is mentioned.
    fn bot_user_id(&self) -> &str;

    /// Start the chat client listener.
    ///
    /// This sets up event listeners for the chat platform and begins processing
    /// incoming messages and events.
    async fn start(&self) -> Void;

    /// Send a card in reply to a message.
    async fn send_card(&self, conversation_id: &str, message_id: &str, card: &Card) -> Void;

    /// Send a plain text reply to a message.
    async fn send_reply(&self, conversation_id: &str, message_id: &str, text: &str) -> Void;
}

// Structs.

/// Chat client for the application.
///
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<dyn GenericChatClient>,
}

impl Deref for ChatClient {
    type Target = dyn GenericChatClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl ChatClient {
    pub fn new(inner: Arc<dyn GenericChatClient>) -> Self {
        Self { inner }
    }
}

// Tests.
