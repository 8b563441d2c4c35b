use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::Channel;

/// Messaging provider that delivered a webhook
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    WhatsappCloud,
}

impl Provider {
    pub fn channel(&self) -> Channel {
        match self {
            Self::WhatsappCloud => Channel::Whatsapp,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WhatsappCloud => write!(f, "whatsapp_cloud"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Status,
    Postback,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Message => "message",
            Self::Status => "status",
            Self::Postback => "postback",
        };
        write!(f, "{}", s)
    }
}

/// Delivery status reported for an outbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Internal event produced by the normalizer. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    pub provider: Provider,
    pub workspace_id: Uuid,
    /// Provider-side conversation key (customer id); matches `Thread::external_id`
    pub thread_id: String,
    /// Business account (phone number id) that received the event
    pub account_id: String,
    /// Unique per event. Status events use `<message id>:<status>`.
    pub external_message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub text: Option<String>,
    pub postback_payload: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
    pub raw_payload: Value,
}

/// A provider entry that could not be turned into an event
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizationSkipped {
    /// JSON-pointer-ish location inside the payload, e.g. `entry[0].changes[1].messages[2]`
    pub location: String,
    pub reason: String,
}

/// Result of normalizing one webhook delivery
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedBatch {
    pub events: Vec<InboundEvent>,
    pub skipped: Vec<NormalizationSkipped>,
    /// Events dropped because their external id repeated within the request
    pub duplicates: usize,
}

// ---------------------------------------------------------------------------
// WhatsApp Cloud API payload shapes
// ---------------------------------------------------------------------------

/// Top-level webhook envelope. Entries stay raw so one bad entry
/// cannot fail the whole batch.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub field: Option<String>,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeMetadata {
    pub phone_number_id: String,
    pub display_phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeContact {
    pub wa_id: String,
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Deserialize)]
pub struct ContactProfile {
    pub name: Option<String>,
}

/// Raw message object; `kind` selects which body field is populated
#[derive(Debug, Deserialize)]
pub struct WaMessage {
    pub from: String,
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<WaText>,
    pub button: Option<WaButton>,
    pub interactive: Option<WaInteractive>,
    pub image: Option<WaMedia>,
    pub video: Option<WaMedia>,
    pub audio: Option<WaMedia>,
    pub document: Option<WaMedia>,
}

#[derive(Debug, Deserialize)]
pub struct WaText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WaButton {
    pub payload: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaInteractive {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub button_reply: Option<WaReply>,
    pub list_reply: Option<WaReply>,
}

#[derive(Debug, Deserialize)]
pub struct WaReply {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaMedia {
    pub id: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaStatus {
    pub id: String,
    pub status: String,
    pub timestamp: String,
    pub recipient_id: String,
}

/// Known message shapes plus a catch-all
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Button { payload: Option<String>, text: Option<String> },
    InteractiveReply { id: String, title: Option<String> },
    Media { kind: String, caption: Option<String> },
    Unrecognized(String),
}

impl From<&WaMessage> for MessageContent {
    fn from(msg: &WaMessage) -> Self {
        match msg.kind.as_str() {
            "text" => match &msg.text {
                Some(t) => Self::Text(t.body.clone()),
                None => Self::Unrecognized("text without body".to_string()),
            },
            "button" => match &msg.button {
                Some(b) => Self::Button {
                    payload: b.payload.clone(),
                    text: b.text.clone(),
                },
                None => Self::Unrecognized("button without body".to_string()),
            },
            "interactive" => {
                let reply = msg
                    .interactive
                    .as_ref()
                    .and_then(|i| i.button_reply.as_ref().or(i.list_reply.as_ref()));
                match reply {
                    Some(r) => Self::InteractiveReply {
                        id: r.id.clone(),
                        title: r.title.clone(),
                    },
                    None => Self::Unrecognized("interactive without reply".to_string()),
                }
            }
            kind @ ("image" | "video" | "audio" | "document") => {
                let media = match kind {
                    "image" => msg.image.as_ref(),
                    "video" => msg.video.as_ref(),
                    "audio" => msg.audio.as_ref(),
                    _ => msg.document.as_ref(),
                };
                Self::Media {
                    kind: kind.to_string(),
                    caption: media.and_then(|m| m.caption.clone()),
                }
            }
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

/// One item inside a change value
#[derive(Debug)]
pub enum ChangeEvent {
    Message(WaMessage),
    Status(WaStatus),
    Unrecognized(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> WaMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_text_message_content() {
        let msg = message(json!({
            "from": "1555", "id": "wamid.1", "timestamp": "1700000000",
            "type": "text", "text": {"body": "hello"}
        }));
        assert_eq!(MessageContent::from(&msg), MessageContent::Text("hello".into()));
    }

    #[test]
    fn test_interactive_list_reply_content() {
        let msg = message(json!({
            "from": "1555", "id": "wamid.2", "timestamp": "1700000000",
            "type": "interactive",
            "interactive": {"type": "list_reply", "list_reply": {"id": "opt-2", "title": "Billing"}}
        }));
        assert_eq!(
            MessageContent::from(&msg),
            MessageContent::InteractiveReply {
                id: "opt-2".into(),
                title: Some("Billing".into())
            }
        );
    }

    #[test]
    fn test_unknown_kind_is_unrecognized() {
        let msg = message(json!({
            "from": "1555", "id": "wamid.3", "timestamp": "1700000000",
            "type": "sticker", "sticker": {"id": "s1"}
        }));
        assert_eq!(
            MessageContent::from(&msg),
            MessageContent::Unrecognized("sticker".into())
        );
    }

    #[test]
    fn test_delivery_status_parse() {
        assert_eq!(DeliveryStatus::parse("read"), Some(DeliveryStatus::Read));
        assert_eq!(DeliveryStatus::parse("deleted"), None);
    }
}
