//! Built-in commands.
//!
//! Commands are declared in [`COMMANDS`], in the order the pipeline tries them.
//! Each command accepts an ASCII form and a localized form. Matching is literal:
//! zero-argument commands must equal an alias (ignoring surrounding whitespace),
//! and commands with an argument must start with one.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::{
    base::{
        prompts,
        types::{AiMode, ChatMessage, Void},
    },
    service::chat::Card,
};

use super::{
    Services,
    context::EventContext,
    pipeline::{Flow, Stage},
    session::{apply_system_prompt, with_default_prompt},
};

// Table.

/// The built-in commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Clear,
    RolePlay,
    Help,
    Balance,
    RoleList,
    AiMode,
    DevTest,
    Summary,
}

/// How a command's aliases are matched against the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// The trimmed text equals an alias.
    Exact,
    /// The text starts with an alias; the rest is the argument.
    Prefix,
}

/// One row of the command table.
#[derive(Debug)]
pub struct CommandSpec {
    pub command: Command,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub rule: MatchRule,
}

impl CommandSpec {
    /// Match the text, returning the (trimmed) argument on success.
    pub fn matches<'a>(&self, text: &'a str) -> Option<&'a str> {
        match self.rule {
            MatchRule::Exact => {
                let trimmed = text.trim();
                self.aliases.iter().any(|alias| trimmed == *alias).then_some("")
            }
            MatchRule::Prefix => self.aliases.iter().find_map(|alias| text.strip_prefix(alias)).map(str::trim),
        }
    }
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: Command::Clear,
        name: "clear",
        aliases: &["/clear", "清除"],
        rule: MatchRule::Exact,
    },
    CommandSpec {
        command: Command::RolePlay,
        name: "role_play",
        aliases: &["/system ", "角色扮演 "],
        rule: MatchRule::Prefix,
    },
    CommandSpec {
        command: Command::Help,
        name: "help",
        aliases: &["/help", "帮助"],
        rule: MatchRule::Exact,
    },
    CommandSpec {
        command: Command::Balance,
        name: "balance",
        aliases: &["/balance", "余额"],
        rule: MatchRule::Exact,
    },
    CommandSpec {
        command: Command::RoleList,
        name: "role_list",
        aliases: &["/roles", "角色列表"],
        rule: MatchRule::Exact,
    },
    CommandSpec {
        command: Command::AiMode,
        name: "ai_mode",
        aliases: &["/ai_mode", "发散模式"],
        rule: MatchRule::Prefix,
    },
    CommandSpec {
        command: Command::DevTest,
        name: "dev_test",
        aliases: &["/dev_test", "开发模式"],
        rule: MatchRule::Prefix,
    },
    CommandSpec {
        command: Command::Summary,
        name: "summary",
        aliases: &["/summary", "总结"],
        rule: MatchRule::Prefix,
    },
];

// Stage.

/// Pipeline stage for one command of the table.
pub struct CommandStage {
    spec: &'static CommandSpec,
    services: Services,
}

impl CommandStage {
    pub fn new(spec: &'static CommandSpec, services: Services) -> Self {
        Self { spec, services }
    }

    async fn execute(&self, argument: &str, event: &EventContext) -> Void {
        let chat = &self.services.chat;
        let (conversation_id, message_id, session_id) = (&event.conversation_id, &event.message_id, &event.session_id);

        match self.spec.command {
            // Clearing happens once the user confirms on the card.
            Command::Clear => chat.send_card(conversation_id, message_id, &Card::ClearConfirm { session_id: session_id.clone() }).await,
            Command::RolePlay => {
                {
                    let _guard = self.services.session.lock(session_id).await;
                    apply_system_prompt(&self.services.session, session_id, argument).await;
                }

                chat.send_card(
                    conversation_id,
                    message_id,
                    &Card::SystemInstruction {
                        instruction: argument.to_string(),
                    },
                )
                .await
            }
            Command::Help => chat.send_card(conversation_id, message_id, &Card::Help).await,
            Command::Balance => match event.scope.run(self.services.llm.get_balance()).await {
                Ok(balance) => chat.send_card(conversation_id, message_id, &Card::Balance(balance)).await,
                Err(err) => {
                    warn!("Balance query failed: {err}");
                    chat.send_reply(conversation_id, message_id, prompts::BALANCE_FAILED).await
                }
            },
            Command::RoleList => {
                let tags = self.services.roles.all_unique_tags();

                chat.send_card(
                    conversation_id,
                    message_id,
                    &Card::RoleTags {
                        session_id: session_id.clone(),
                        tags,
                    },
                )
                .await
            }
            Command::AiMode => {
                chat.send_card(
                    conversation_id,
                    message_id,
                    &Card::AiModes {
                        session_id: session_id.clone(),
                        modes: AiMode::ALL.to_vec(),
                    },
                )
                .await
            }
            Command::DevTest => {
                chat.send_card(
                    conversation_id,
                    message_id,
                    &Card::DevTest {
                        modes: AiMode::ALL.to_vec(),
                        generated_at: Utc::now(),
                    },
                )
                .await
            }
            Command::Summary => self.summarize(event).await,
        }
    }

    /// Answer the message with a tool-augmented completion.
    ///
    /// The history is only written back once the completion succeeded.
    #[instrument(skip_all)]
    async fn summarize(&self, event: &EventContext) -> Void {
        let Services { chat, llm, session, .. } = &self.services;

        let _guard = session.lock(&event.session_id).await;

        let mut history = with_default_prompt(session.get_history(&event.session_id).await, &self.services.default_system_prompt);
        history.push(ChatMessage::user(event.parsed_text.clone()));

        let mode = session.get_mode(&event.session_id).await;

        if let Err(err) = chat.send_reply(&event.conversation_id, &event.message_id, prompts::SUMMARY_WORKING).await {
            warn!("Failed to send the summary notice: {err}");
        }

        info!("Summarizing in `{mode}` mode ...");

        match event.scope.run(llm.complete_with_tools(&history, mode)).await {
            Ok(answer) => {
                let content = answer.content.clone();
                history.push(answer);
                session.set_history(&event.session_id, history).await;

                chat.send_reply(&event.conversation_id, &event.message_id, &content).await
            }
            Err(err) => {
                warn!("Summary completion failed: {err}");
                chat.send_reply(&event.conversation_id, &event.message_id, &prompts::completion_failed(&err)).await
            }
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &'static str {
        self.spec.name
    }

    async fn evaluate(&self, event: &EventContext) -> Flow {
        let Some(argument) = self.spec.matches(&event.parsed_text) else {
            return Flow::Continue;
        };

        info!(message_id = %event.message_id, "Running `{}` command.", self.spec.name);

        // The message is handled even if the response could not be delivered.
        if let Err(err) = self.execute(argument, event).await {
            error!("Error while handling `{}`: {}", self.spec.name, err);
        }

        Flow::Stop
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: Command) -> &'static CommandSpec {
        COMMANDS.iter().find(|s| s.command == command).unwrap()
    }

    fn matching(text: &str) -> Vec<Command> {
        COMMANDS.iter().filter(|s| s.matches(text).is_some()).map(|s| s.command).collect()
    }

    #[test]
    fn test_exact_commands_ignore_surrounding_whitespace_only() {
        assert_eq!(spec(Command::Clear).matches("/clear"), Some(""));
        assert_eq!(spec(Command::Clear).matches("  清除 "), Some(""));
        assert_eq!(spec(Command::Clear).matches("/clear now"), None);
        assert_eq!(spec(Command::Clear).matches("/CLEAR"), None);
        assert_eq!(spec(Command::Help).matches("帮助"), Some(""));
    }

    #[test]
    fn test_prefix_commands_return_argument() {
        assert_eq!(spec(Command::RolePlay).matches("/system You are a pirate."), Some("You are a pirate."));
        assert_eq!(spec(Command::RolePlay).matches("角色扮演 海盗"), Some("海盗"));
        assert_eq!(spec(Command::RolePlay).matches("/system"), None);
        assert_eq!(spec(Command::Summary).matches("/summary https://example.com"), Some("https://example.com"));
        assert_eq!(spec(Command::AiMode).matches("/ai_mode"), Some(""));
        assert_eq!(spec(Command::Summary).matches("please /summary"), None);
    }

    #[test]
    fn test_each_alias_routes_to_exactly_one_command() {
        for spec in COMMANDS {
            for alias in spec.aliases {
                let text = if spec.rule == MatchRule::Prefix { format!("{alias} arg") } else { alias.to_string() };

                assert_eq!(matching(&text), vec![spec.command], "alias `{alias}`");
            }
        }
    }

    #[test]
    fn test_plain_text_matches_nothing() {
        assert!(matching("what is the weather like?").is_empty());
        assert!(matching("").is_empty());
    }

    #[test]
    fn test_command_names_are_unique() {
        let mut names = COMMANDS.iter().map(|s| s.name).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();

        assert_eq!(names.len(), COMMANDS.len());
    }
}
