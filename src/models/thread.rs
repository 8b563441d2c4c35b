use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Messaging channel a thread lives on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Whatsapp,
    Messenger,
    Instagram,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Whatsapp => "whatsapp",
            Self::Messenger => "messenger",
            Self::Instagram => "instagram",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::Whatsapp),
            "messenger" => Ok(Self::Messenger),
            "instagram" => Ok(Self::Instagram),
            other => Err(format!("unknown channel `{other}`")),
        }
    }
}

/// Thread priority tier, drives the SLA response budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" | "med" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

/// Ticket status of a thread
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Open,
    Pending,
    Solved,
    Spam,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Solved => "solved",
            Self::Spam => "spam",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "pending" => Ok(Self::Pending),
            "solved" => Ok(Self::Solved),
            "spam" => Ok(Self::Spam),
            other => Err(format!("unknown thread status `{other}`")),
        }
    }
}

/// A single ongoing conversation with an external contact.
///
/// `first_response_at` is monotonic: once set it is never overwritten.
/// Stores enforce this with a compare-and-set on `NULL`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub channel: Channel,
    /// Provider-side conversation key (the customer's WhatsApp id)
    pub external_id: String,
    /// Business account that received the conversation (phone number id)
    pub account_id: String,
    pub contact_name: Option<String>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub last_agent_reply_at: Option<DateTime<Utc>>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
    pub ai_enabled: bool,
    pub unread_count: i32,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
    pub status: ThreadStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(workspace_id: Uuid, channel: Channel, external_id: &str, account_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            channel,
            external_id: external_id.to_string(),
            account_id: account_id.to_string(),
            contact_name: None,
            last_customer_message_at: None,
            last_agent_reply_at: None,
            first_response_at: None,
            last_message_text: None,
            ai_enabled: true,
            unread_count: 0,
            tags: BTreeSet::new(),
            priority: Priority::default(),
            status: ThreadStatus::default(),
            assigned_agent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// True when the latest customer message has not been answered yet
    pub fn awaiting_response(&self) -> bool {
        match (self.last_customer_message_at, self.last_agent_reply_at) {
            (Some(customer), Some(agent)) => customer > agent,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Identifies where a thread should be found or created
#[derive(Debug, Clone)]
pub struct ThreadKey {
    pub workspace_id: Uuid,
    pub channel: Channel,
    pub external_id: String,
    pub account_id: String,
    pub contact_name: Option<String>,
}

/// Human agent that threads can be assigned to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub active: bool,
    /// Number of open threads currently assigned
    pub open_threads: i64,
}
