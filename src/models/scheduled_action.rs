use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Action;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledActionStatus {
    #[default]
    Pending,
    Executed,
    Cancelled,
    Failed,
}

impl ScheduledActionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ScheduledActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ScheduledActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executed" => Ok(Self::Executed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown scheduled action status `{other}`")),
        }
    }
}

/// Deferred action executed at or after `run_at`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub run_at: DateTime<Utc>,
    pub action_type: String,
    pub payload: Action,
    pub status: ScheduledActionStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledAction {
    pub fn new(
        workspace_id: Uuid,
        thread_id: Option<Uuid>,
        rule_id: Option<Uuid>,
        run_at: DateTime<Utc>,
        payload: Action,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            thread_id,
            rule_id,
            run_at,
            action_type: payload.kind().to_string(),
            payload,
            status: ScheduledActionStatus::Pending,
            attempt: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// API request for creating a scheduled action
#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduledAction {
    pub thread_id: Option<Uuid>,
    pub run_at: DateTime<Utc>,
    pub action: Action,
}
