use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::{
    config::Config,
    error::ProviderError,
    models::{LLMProvider, Prompt, ProviderReply},
    services::provider_types::{AnthropicRequest, AnthropicResponse, OpenAIRequest, OpenAIResponse},
};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Uniform text-completion adapter over an LLM vendor
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn kind(&self) -> LLMProvider;

    async fn complete(&self, prompt: &Prompt) -> Result<ProviderReply, ProviderError>;
}

/// Anthropic Messages API
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, api_key: SecretString) -> Self {
        Self {
            client,
            api_key,
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn kind(&self) -> LLMProvider {
        LLMProvider::Anthropic
    }

    async fn complete(&self, prompt: &Prompt) -> Result<ProviderReply, ProviderError> {
        let request = AnthropicRequest::from_prompt(prompt);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::CallFailed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::CallFailed(format!(
                "Anthropic API error {status}: {error_text}"
            )));
        }

        let result: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::CallFailed(format!("failed to parse response: {e}")))?;

        Ok(ProviderReply {
            text: result.text(),
            tokens_in: result.usage.as_ref().map(|u| u.input_tokens),
            tokens_out: result.usage.as_ref().map(|u| u.output_tokens),
        })
    }
}

/// OpenAI chat completions API
pub struct OpenAIProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(client: Client, api_key: SecretString) -> Self {
        Self {
            client,
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AiProvider for OpenAIProvider {
    fn kind(&self) -> LLMProvider {
        LLMProvider::OpenAI
    }

    async fn complete(&self, prompt: &Prompt) -> Result<ProviderReply, ProviderError> {
        let request = OpenAIRequest::from_prompt(prompt);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::CallFailed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::CallFailed(format!(
                "OpenAI API error {status}: {error_text}"
            )));
        }

        let result: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::CallFailed(format!("failed to parse response: {e}")))?;

        Ok(ProviderReply {
            text: result.text(),
            tokens_in: result.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: result.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}

/// Configured providers, looked up by workspace setting
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    anthropic: Option<Arc<dyn AiProvider>>,
    openai: Option<Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own kind, replacing any previous one
    pub fn with(mut self, provider: Arc<dyn AiProvider>) -> Self {
        match provider.kind() {
            LLMProvider::Anthropic => self.anthropic = Some(provider),
            LLMProvider::OpenAI => self.openai = Some(provider),
        }
        self
    }

    /// Providers whose API keys are present in config
    pub fn from_config(config: &Config, client: Client) -> Self {
        let mut registry = Self::new();
        if let Some(key) = &config.anthropic_api_key {
            registry = registry.with(Arc::new(AnthropicProvider::new(client.clone(), key.clone())));
        }
        if let Some(key) = &config.openai_api_key {
            registry = registry.with(Arc::new(OpenAIProvider::new(client, key.clone())));
        }
        registry
    }

    pub fn get(&self, kind: LLMProvider) -> Result<Arc<dyn AiProvider>, ProviderError> {
        let provider = match kind {
            LLMProvider::Anthropic => self.anthropic.clone(),
            LLMProvider::OpenAI => self.openai.clone(),
        };
        provider.ok_or_else(|| ProviderError::NotConfigured(kind.to_string()))
    }
}

/// Rough token count when a provider returns no usage: one token per four
/// characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(4).min(u32::MAX as usize) as u32
}
