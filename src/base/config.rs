//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};

use crate::base::prompts;

use super::types::Res;

/// Default OpenAI API base URL.
fn default_openai_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Default OpenAI model to use.
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default max output tokens for OpenAI model
fn default_openai_max_tokens() -> u32 {
    4096
}

/// Default bound for a single external call (LLM completion, balance query).
fn default_call_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Default bound for one attempt at an OpenAI request. Failed attempts are retried inside `call_timeout`.
fn default_openai_request_timeout() -> Duration {
    Duration::from_secs(45)
}

/// Default lifetime of a dedup entry.
fn default_dedup_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Default lifetime of an idle session.
fn default_session_ttl() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

/// Default system prompt for sessions that never had one set.
fn default_system_prompt() -> String {
    prompts::DEFAULT_SYSTEM_PROMPT.to_string()
}

/// Default path of the role list.
fn default_roles_path() -> PathBuf {
    PathBuf::from("role_list.toml")
}

/// Configuration for the relay-bot application.
#[derive(Debug, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ConfigInner {
    /// OpenAI API key (`OPENAI_API_KEY`).
    pub openai_api_key: String,
    /// OpenAI API base URL (`OPENAI_API_BASE`).
    #[serde(default = "default_openai_api_base")]
    pub openai_api_base: String,
    /// OpenAI model to use (`OPENAI_MODEL`).
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Max output tokens for OpenAI model (`OPENAI_MAX_TOKENS`).
    #[serde(default = "default_openai_max_tokens")]
    pub openai_max_tokens: u32,
    /// Bound, in seconds, on each external call a command makes (`CALL_TIMEOUT`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_call_timeout")]
    pub call_timeout: Duration,
    /// Bound, in seconds, on a single OpenAI request attempt (`OPENAI_REQUEST_TIMEOUT`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_openai_request_timeout")]
    pub openai_request_timeout: Duration,
    /// How long, in seconds, a processed message id is remembered (`DEDUP_TTL`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl: Duration,
    /// How long, in seconds, an idle session is kept (`SESSION_TTL`).
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_session_ttl")]
    pub session_ttl: Duration,
    /// System prompt applied to sessions without one (`DEFAULT_SYSTEM_PROMPT`).
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    /// Path to the role list TOML file (`ROLES_PATH`).
    #[serde(default = "default_roles_path")]
    pub roles_path: PathBuf,
    /// Slack app token (`SLACK_APP_TOKEN`).
    pub slack_app_token: String,
    /// Slack bot token (`SLACK_BOT_TOKEN`).
    pub slack_bot_token: String,
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_api_base: default_openai_api_base(),
            openai_model: default_openai_model(),
            openai_max_tokens: default_openai_max_tokens(),
            call_timeout: default_call_timeout(),
            openai_request_timeout: default_openai_request_timeout(),
            dedup_ttl: default_dedup_ttl(),
            session_ttl: default_session_ttl(),
            default_system_prompt: default_system_prompt(),
            roles_path: default_roles_path(),
            slack_app_token: String::new(),
            slack_bot_token: String::new(),
        }
    }
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(config::Environment::default().prefix("RELAY_BOT"));

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    fn validate(&self) -> Res<()> {
        if self.openai_max_tokens < 1 || self.openai_max_tokens > 128000 {
            return Err(anyhow::anyhow!("OpenAI max tokens must be between 1 and 128000."));
        }

        if self.call_timeout.is_zero() {
            return Err(anyhow::anyhow!("Call timeout must be greater than zero."));
        }

        if self.openai_request_timeout.is_zero() || self.openai_request_timeout >= self.call_timeout {
            return Err(anyhow::anyhow!("OpenAI request timeout must be greater than zero and shorter than the call timeout."));
        }

        if self.dedup_ttl.is_zero() || self.session_ttl.is_zero() {
            return Err(anyhow::anyhow!("Cache TTLs must be greater than zero."));
        }

        Ok(())
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

    /// A config file in the temp dir, removed on drop.
    struct TempConfig(PathBuf);

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn write_config(contents: &str) -> TempConfig {
        let n = NEXT_FILE.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("relay-bot-config-{}-{n}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        TempConfig(path)
    }

    #[test]
    fn test_load_applies_defaults() {
        let path = write_config(
            r#"
openai_api_key = "sk-test"
slack_app_token = "xapp-test"
slack_bot_token = "xoxb-test"
"#,
        );

        let config = Config::load(Some(&path.0)).unwrap();

        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.call_timeout, Duration::from_secs(120));
        assert_eq!(config.openai_request_timeout, Duration::from_secs(45));
        assert_eq!(config.dedup_ttl, Duration::from_secs(1800));
        assert_eq!(config.roles_path, PathBuf::from("role_list.toml"));
        assert!(!config.default_system_prompt.is_empty());
    }

    #[test]
    fn test_load_reads_durations_as_seconds() {
        let path = write_config(
            r#"
openai_api_key = "sk-test"
slack_app_token = "xapp-test"
slack_bot_token = "xoxb-test"
call_timeout = 15
openai_request_timeout = 5
session_ttl = 60
"#,
        );

        let config = Config::load(Some(&path.0)).unwrap();

        assert_eq!(config.call_timeout, Duration::from_secs(15));
        assert_eq!(config.openai_request_timeout, Duration::from_secs(5));
        assert_eq!(config.session_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = Config {
            inner: Arc::new(ConfigInner {
                call_timeout: Duration::ZERO,
                ..Default::default()
            }),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_request_timeout_not_below_call_timeout() {
        let config = Config {
            inner: Arc::new(ConfigInner {
                call_timeout: Duration::from_secs(30),
                openai_request_timeout: Duration::from_secs(30),
                ..Default::default()
            }),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_config_files_are_unique_and_removed() {
        let first = write_config("a = 1");
        let second = write_config("b = 2");
        let (first_path, second_path) = (first.0.clone(), second.0.clone());

        assert_ne!(first_path, second_path);

        drop(first);
        drop(second);

        assert!(!first_path.exists());
        assert!(!second_path.exists());
    }

    #[test]
    fn test_validate_rejects_max_tokens_out_of_range() {
        let config = Config {
            inner: Arc::new(ConfigInner {
                openai_max_tokens: 0,
                ..Default::default()
            }),
        };

        assert!(config.validate().is_err());
        assert!(Config { inner: Arc::new(ConfigInner::default()) }.validate().is_ok());
    }
}
