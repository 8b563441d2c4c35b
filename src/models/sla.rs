use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Priority, ThreadStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BreachType {
    /// No agent has replied on the thread yet
    FirstResponse,
    /// The latest customer message is unanswered
    NextResponse,
}

impl fmt::Display for BreachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstResponse => write!(f, "first_response"),
            Self::NextResponse => write!(f, "next_response"),
        }
    }
}

impl FromStr for BreachType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_response" => Ok(Self::FirstResponse),
            "next_response" => Ok(Self::NextResponse),
            other => Err(format!("unknown breach type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaInput {
    pub priority: Priority,
    pub ticket_status: ThreadStatus,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub last_agent_reply_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlaResult {
    pub next_response_due_at: Option<DateTime<Utc>>,
    pub breached: bool,
    pub breach_type: Option<BreachType>,
}

impl SlaResult {
    pub fn not_tracked() -> Self {
        Self {
            next_response_due_at: None,
            breached: false,
            breach_type: None,
        }
    }
}

/// Deduplication key for escalations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EscalationKey {
    pub conversation_id: Uuid,
    pub breach_type: BreachType,
    pub due_at: DateTime<Utc>,
}

/// Event generated when an SLA deadline is breached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub thread_id: Uuid,
    pub breach_type: BreachType,
    pub due_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl Escalation {
    pub fn key(&self) -> EscalationKey {
        EscalationKey {
            conversation_id: self.thread_id,
            breach_type: self.breach_type,
            due_at: self.due_at,
        }
    }
}
