use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::{Priority, ThreadStatus};

/// What kind of event a rule listens to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    NewMessage,
    TagAdded,
    StatusChanged,
    TimeElapsed,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NewMessage => "new_message",
            Self::TagAdded => "tag_added",
            Self::StatusChanged => "status_changed",
            Self::TimeElapsed => "time_elapsed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_message" => Ok(Self::NewMessage),
            "tag_added" => Ok(Self::TagAdded),
            "status_changed" => Ok(Self::StatusChanged),
            "time_elapsed" => Ok(Self::TimeElapsed),
            other => Err(format!("unknown trigger `{other}`")),
        }
    }
}

/// Timestamp a time-elapsed condition measures from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeReference {
    /// When the triggering event occurred
    Event,
    LastCustomerMessage,
    LastAgentReply,
}

/// Thread field addressable by `field_equals`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadField {
    Channel,
    ContactName,
    ExternalId,
    AccountId,
    AssignedAgentId,
}

/// A pure predicate over (event, thread, now)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    HasTag { tag: String },
    LacksTag { tag: String },
    TimeElapsed { since: TimeReference, minutes: i64 },
    FieldEquals { field: ThreadField, value: String },
    StatusEquals { status: ThreadStatus },
    PriorityEquals { priority: Priority },
    /// Case-insensitive match on any of the keywords
    MessageContains { keywords: Vec<String> },
    MessageMatches { pattern: String },
}

/// How `assign_agent` picks an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    LoadBased,
}

/// An action attached to a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ApplyTag {
        tag: String,
    },
    ChangeStatus {
        status: ThreadStatus,
    },
    AssignAgent {
        #[serde(default)]
        strategy: AssignmentStrategy,
    },
    /// Sends a text reply; a positive delay turns it into a scheduled action
    SendMessage {
        text: String,
        #[serde(default)]
        delay_minutes: i64,
    },
    TriggerHandoff {
        reason: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApplyTag { .. } => "apply_tag",
            Self::ChangeStatus { .. } => "change_status",
            Self::AssignAgent { .. } => "assign_agent",
            Self::SendMessage { .. } => "send_message",
            Self::TriggerHandoff { .. } => "trigger_handoff",
        }
    }

    /// Delay before the action may run, if it must be deferred
    pub fn deferral(&self) -> Option<i64> {
        match self {
            Self::SendMessage { delay_minutes, .. } if *delay_minutes > 0 => Some(*delay_minutes),
            _ => None,
        }
    }
}

/// Workspace-owned automation rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRule {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub enabled: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// DTO for creating a rule
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAutomationRule {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[validate(length(min = 1, max = 20))]
    pub actions: Vec<Action>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    #[validate(range(min = -1000, max = 1000))]
    pub priority: i32,
}

/// DTO for updating a rule; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateAutomationRule {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub trigger: Option<Trigger>,
    pub conditions: Option<Vec<Condition>>,
    #[validate(length(min = 1, max = 20))]
    pub actions: Option<Vec<Action>>,
    pub enabled: Option<bool>,
    #[validate(range(min = -1000, max = 1000))]
    pub priority: Option<i32>,
}

fn default_enabled() -> bool {
    true
}

/// Event fed to the rule engine
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvent {
    pub trigger: Trigger,
    pub workspace_id: Uuid,
    pub thread_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub message_text: Option<String>,
    /// Tag involved in a `tag_added` event
    pub tag: Option<String>,
    /// Status before a `status_changed` event
    pub previous_status: Option<ThreadStatus>,
}

impl RuleEvent {
    pub fn new_message(
        workspace_id: Uuid,
        thread_id: Uuid,
        occurred_at: DateTime<Utc>,
        text: Option<String>,
    ) -> Self {
        Self {
            trigger: Trigger::NewMessage,
            workspace_id,
            thread_id,
            occurred_at,
            message_text: text,
            tag: None,
            previous_status: None,
        }
    }

    pub fn tag_added(workspace_id: Uuid, thread_id: Uuid, tag: &str, at: DateTime<Utc>) -> Self {
        Self {
            trigger: Trigger::TagAdded,
            workspace_id,
            thread_id,
            occurred_at: at,
            message_text: None,
            tag: Some(tag.to_string()),
            previous_status: None,
        }
    }

    pub fn status_changed(
        workspace_id: Uuid,
        thread_id: Uuid,
        previous: ThreadStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            trigger: Trigger::StatusChanged,
            workspace_id,
            thread_id,
            occurred_at: at,
            message_text: None,
            tag: None,
            previous_status: Some(previous),
        }
    }

    pub fn time_elapsed(workspace_id: Uuid, thread_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            trigger: Trigger::TimeElapsed,
            workspace_id,
            thread_id,
            occurred_at: at,
            message_text: None,
            tag: None,
            previous_status: None,
        }
    }
}

/// A matched rule and the actions to apply, in declared order
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

/// Lifecycle of one rule evaluation
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Idle,
    Matching,
    Matched,
    NotMatched,
    Executing,
    Succeeded,
    Failed,
}

impl RuleState {
    /// Valid next states
    pub fn can_transition_to(&self, next: RuleState) -> bool {
        matches!(
            (self, next),
            (RuleState::Idle, RuleState::Matching)
                | (RuleState::Matching, RuleState::Matched)
                | (RuleState::Matching, RuleState::NotMatched)
                | (RuleState::Matched, RuleState::Executing)
                | (RuleState::Executing, RuleState::Succeeded)
                | (RuleState::Executing, RuleState::Failed)
        )
    }
}

/// What happened to a single action at apply time
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied { action: String },
    Scheduled { action: String, scheduled_action_id: Uuid },
    /// Conditions no longer held when re-checked at apply time
    SkippedStale { action: String },
    Failed { action: String, error: String },
}

/// Result of executing one plan
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleExecution {
    pub rule_id: Uuid,
    pub state: RuleState,
    pub outcomes: Vec<ActionOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_deserializes_tagged() {
        let c: Condition = serde_json::from_value(json!({"type": "has_tag", "tag": "vip"})).unwrap();
        assert_eq!(c, Condition::HasTag { tag: "vip".into() });

        let c: Condition =
            serde_json::from_value(json!({"type": "status_equals", "status": "open"})).unwrap();
        assert_eq!(
            c,
            Condition::StatusEquals {
                status: ThreadStatus::Open
            }
        );
    }

    #[test]
    fn test_action_defaults() {
        let a: Action = serde_json::from_value(json!({"type": "assign_agent"})).unwrap();
        assert_eq!(
            a,
            Action::AssignAgent {
                strategy: AssignmentStrategy::RoundRobin
            }
        );

        let a: Action = serde_json::from_value(json!({"type": "send_message", "text": "hi"})).unwrap();
        assert_eq!(a.deferral(), None);
    }

    #[test]
    fn test_delayed_send_is_deferred() {
        let a = Action::SendMessage {
            text: "follow up".into(),
            delay_minutes: 30,
        };
        assert_eq!(a.deferral(), Some(30));
        assert_eq!(a.kind(), "send_message");
    }

    #[test]
    fn test_rule_state_transitions() {
        assert!(RuleState::Idle.can_transition_to(RuleState::Matching));
        assert!(RuleState::Matching.can_transition_to(RuleState::NotMatched));
        assert!(RuleState::Executing.can_transition_to(RuleState::Failed));
        assert!(!RuleState::NotMatched.can_transition_to(RuleState::Executing));
        assert!(!RuleState::Idle.can_transition_to(RuleState::Succeeded));
    }

    #[test]
    fn test_trigger_roundtrip_through_str() {
        for t in [
            Trigger::NewMessage,
            Trigger::TagAdded,
            Trigger::StatusChanged,
            Trigger::TimeElapsed,
        ] {
            assert_eq!(t.to_string().parse::<Trigger>().unwrap(), t);
        }
    }
}
