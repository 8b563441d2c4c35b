use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::SendError, models::Thread};

/// Outbound delivery of a text message on a thread's channel
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Returns the provider message id
    async fn send_text(&self, thread: &Thread, text: &str) -> Result<String, SendError>;
}

/// WhatsApp Cloud API sender (`POST /{phone_number_id}/messages`)
pub struct WhatsAppCloudSender {
    client: Client,
    access_token: Option<SecretString>,
    base_url: String,
}

impl WhatsAppCloudSender {
    pub fn new(client: Client, access_token: Option<SecretString>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            access_token,
            base_url: base_url.into(),
        }
    }

    pub fn from_config(config: &Config, client: Client) -> Self {
        Self::new(
            client,
            config.whatsapp_access_token.clone(),
            config.graph_api_base_url.clone(),
        )
    }
}

#[derive(Debug, Serialize)]
struct OutboundText<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: OutboundBody<'a>,
}

#[derive(Debug, Serialize)]
struct OutboundBody<'a> {
    preview_url: bool,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[async_trait]
impl MessageSender for WhatsAppCloudSender {
    async fn send_text(&self, thread: &Thread, text: &str) -> Result<String, SendError> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| SendError::NotConfigured("WHATSAPP_ACCESS_TOKEN".to_string()))?;

        let body = OutboundText {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: &thread.external_id,
            kind: "text",
            text: OutboundBody {
                preview_url: false,
                body: text,
            },
        };

        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.base_url.trim_end_matches('/'),
                thread.account_id
            ))
            .bearer_auth(token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Failed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SendError::Failed(format!("Graph API error {status}: {error_text}")));
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Failed(format!("failed to parse response: {e}")))?;

        sent.messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| SendError::Failed("response carried no message id".to_string()))
    }
}
