use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// LLM Provider types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    #[default]
    Anthropic,
}

impl fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl FromStr for LLMProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

/// Per-workspace AI auto-reply settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AIReplySettings {
    pub workspace_id: Uuid,
    pub allow_automation: bool,
    pub provider: LLMProvider,
    pub model: String,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Monthly token budget (input + output); `None` means uncapped
    pub monthly_token_cap: Option<i64>,
    pub sandbox_enabled: bool,
    /// Recipients allowed to receive replies while sandboxed
    pub sandbox_whitelist: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl AIReplySettings {
    /// Settings for a workspace that has never configured AI: disabled
    pub fn disabled(workspace_id: Uuid) -> Self {
        Self {
            workspace_id,
            allow_automation: false,
            provider: LLMProvider::default(),
            model: "claude-sonnet-4-20250514".to_string(),
            system_prompt: "You are a helpful customer support assistant. Answer briefly and politely."
                .to_string(),
            max_output_tokens: 512,
            temperature: 0.3,
            monthly_token_cap: None,
            sandbox_enabled: false,
            sandbox_whitelist: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_whitelisted(&self, recipient: &str) -> bool {
        self.sandbox_whitelist.iter().any(|r| r == recipient)
    }
}

/// Partial update of AI settings
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateAIReplySettings {
    pub allow_automation: Option<bool>,
    pub provider: Option<LLMProvider>,
    #[validate(length(min = 1, max = 100))]
    pub model: Option<String>,
    #[validate(length(max = 8000))]
    pub system_prompt: Option<String>,
    #[validate(range(min = 1, max = 8192))]
    pub max_output_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    /// `Some(None)` clears the cap
    #[serde(default, with = "double_option")]
    pub monthly_token_cap: Option<Option<i64>>,
    pub sandbox_enabled: Option<bool>,
    #[validate(length(max = 100))]
    pub sandbox_whitelist: Option<Vec<String>>,
}

impl UpdateAIReplySettings {
    pub fn apply_to(self, settings: &mut AIReplySettings) {
        if let Some(v) = self.allow_automation {
            settings.allow_automation = v;
        }
        if let Some(v) = self.provider {
            settings.provider = v;
        }
        if let Some(v) = self.model {
            settings.model = v;
        }
        if let Some(v) = self.system_prompt {
            settings.system_prompt = v;
        }
        if let Some(v) = self.max_output_tokens {
            settings.max_output_tokens = v;
        }
        if let Some(v) = self.temperature {
            settings.temperature = v;
        }
        if let Some(v) = self.monthly_token_cap {
            settings.monthly_token_cap = v;
        }
        if let Some(v) = self.sandbox_enabled {
            settings.sandbox_enabled = v;
        }
        if let Some(v) = self.sandbox_whitelist {
            settings.sandbox_whitelist = v;
        }
        settings.updated_at = Utc::now();
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Handoff lifecycle of a thread. `HandedOff` is terminal until reset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    #[default]
    None,
    Pending,
    HandedOff,
}

impl HandoffState {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for HandoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::HandedOff => "handed_off",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HandoffState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "handed_off" => Ok(Self::HandedOff),
            other => Err(format!("unknown handoff state `{other}`")),
        }
    }
}

/// Per-thread AI state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadAIState {
    pub thread_id: Uuid,
    pub workspace_id: Uuid,
    pub handoff: HandoffState,
    pub handoff_reason: Option<String>,
    pub handoff_at: Option<DateTime<Utc>>,
    pub last_ai_reply_at: Option<DateTime<Utc>>,
    pub ai_reply_count: i64,
}

impl ThreadAIState {
    pub fn initial(workspace_id: Uuid, thread_id: Uuid) -> Self {
        Self {
            thread_id,
            workspace_id,
            handoff: HandoffState::None,
            handoff_reason: None,
            handoff_at: None,
            last_ai_reply_at: None,
            ai_reply_count: 0,
        }
    }
}

/// Why the orchestrator did or did not reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyReason {
    Replied,
    WorkspaceDisabled,
    ThreadDisabled,
    HandoffActive,
    CapExceeded,
    SandboxBlocked,
    NoContent,
    ProviderCallFailed,
    SendFailed,
}

impl ReplyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::WorkspaceDisabled => "workspace_disabled",
            Self::ThreadDisabled => "thread_disabled",
            Self::HandoffActive => "handoff_active",
            Self::CapExceeded => "cap_exceeded",
            Self::SandboxBlocked => "sandbox_blocked",
            Self::NoContent => "no_content",
            Self::ProviderCallFailed => "provider_call_failed",
            Self::SendFailed => "send_failed",
        }
    }
}

impl fmt::Display for ReplyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of `maybe_reply`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReplyOutcome {
    pub replied: bool,
    pub reason: ReplyReason,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

impl ReplyOutcome {
    pub fn declined(reason: ReplyReason) -> Self {
        Self {
            replied: false,
            reason,
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

/// Chat message for AI conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Provider-agnostic prompt
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    /// Concatenated text of every message, used for token estimation
    pub fn full_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Uniform provider result. Token counts are `None` when the provider
/// returned no usage metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub text: String,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
}

/// Persisted record of one orchestrator decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AIReplyLog {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub thread_id: Uuid,
    pub external_message_id: String,
    pub replied: bool,
    pub reason: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
