//! Wire types for the LLM provider HTTP APIs.
//!
//! Usage blocks are optional on both sides; a missing block means the
//! caller falls back to estimating tokens.

use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, ChatRole, Prompt};

/// Request body for Anthropic Messages API.
#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<WireMessage>,
}

/// A single role/content message, shared by both providers.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Response from Anthropic Messages API.
#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub content: Vec<AnthropicContent>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicContent {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AnthropicRequest {
    /// System messages are lifted into the top-level `system` field.
    pub fn from_prompt(prompt: &Prompt) -> Self {
        let system: Vec<&str> = prompt
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages = prompt
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(WireMessage::from)
            .collect();

        Self {
            model: prompt.model.clone(),
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages,
        }
    }
}

impl AnthropicResponse {
    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Request body for OpenAI chat completions.
#[derive(Debug, Serialize)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponse {
    #[serde(default)]
    pub choices: Vec<OpenAIChoice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: OpenAIChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl OpenAIRequest {
    pub fn from_prompt(prompt: &Prompt) -> Self {
        Self {
            model: prompt.model.clone(),
            messages: prompt.messages.iter().map(WireMessage::from).collect(),
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
        }
    }
}

impl OpenAIResponse {
    pub fn text(&self) -> String {
        self.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default()
    }
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Prompt {
        Prompt {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 256,
            temperature: 0.3,
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: "Be brief.".into(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: "Where is my order?".into(),
                },
            ],
        }
    }

    #[test]
    fn test_anthropic_request_lifts_system_prompt() {
        let req = AnthropicRequest::from_prompt(&prompt());
        assert_eq!(req.system.as_deref(), Some("Be brief."));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
    }

    #[test]
    fn test_anthropic_request_without_system_skips_field() {
        let mut p = prompt();
        p.messages.remove(0);
        let json = serde_json::to_value(AnthropicRequest::from_prompt(&p)).unwrap();
        assert!(json.get("system").is_none());
    }

    #[test]
    fn test_openai_request_keeps_system_message() {
        let req = OpenAIRequest::from_prompt(&prompt());
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
    }

    #[test]
    fn test_anthropic_response_without_usage() {
        let resp: AnthropicResponse =
            serde_json::from_str(r#"{"content":[{"type":"text","text":"Hi"},{"type":"text","text":" there"}]}"#)
                .unwrap();
        assert_eq!(resp.text(), "Hi there");
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_openai_response_empty_choices() {
        let resp: OpenAIResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(resp.text(), "");
    }
}
