use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{TimestampSeconds, serde_as};

pub type Err = anyhow::Error;
pub type Res<T> = Result<T, Err>;
pub type Void = Res<()>;

/// The author of a message in a session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Response mode of a session.
///
/// Each mode maps onto a sampling temperature for the completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    Precise,
    #[default]
    Balanced,
    Creative,
}

impl AiMode {
    /// All modes, in the order they are offered to users.
    pub const ALL: [AiMode; 3] = [AiMode::Precise, AiMode::Balanced, AiMode::Creative];

    pub fn temperature(self) -> f32 {
        match self {
            AiMode::Precise => 0.2,
            AiMode::Balanced => 0.7,
            AiMode::Creative => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AiMode::Precise => "precise",
            AiMode::Balanced => "balanced",
            AiMode::Creative => "creative",
        }
    }
}

impl fmt::Display for AiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiMode {
    type Err = Err;

    fn from_str(s: &str) -> Res<Self> {
        AiMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("Unknown AI mode: `{s}`."))
    }
}

/// Account credit as reported by the LLM provider.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total_granted: f64,
    pub total_used: f64,
    pub total_available: f64,
    #[serde_as(as = "Option<TimestampSeconds<f64>>")]
    pub effective_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<TimestampSeconds<f64>>")]
    pub expires_at: Option<DateTime<Utc>>,
}

// Tests.
