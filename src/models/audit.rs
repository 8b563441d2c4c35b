use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Audit log entry, workspace scoped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLog {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RuleCreated,
    RuleUpdated,
    RuleDeleted,
    RuleExecuted,
    RuleExecutionFailed,
    ActionScheduled,
    ScheduledActionExecuted,
    ScheduledActionFailed,
    ScheduledActionCancelled,
    AiReplySent,
    AiReplyFailed,
    AiSettingsUpdated,
    HandoffTriggered,
    HandoffReset,
    ThreadAiToggled,
    SlaEscalated,
    InboundEventFailed,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RuleCreated => "rule_created",
            Self::RuleUpdated => "rule_updated",
            Self::RuleDeleted => "rule_deleted",
            Self::RuleExecuted => "rule_executed",
            Self::RuleExecutionFailed => "rule_execution_failed",
            Self::ActionScheduled => "action_scheduled",
            Self::ScheduledActionExecuted => "scheduled_action_executed",
            Self::ScheduledActionFailed => "scheduled_action_failed",
            Self::ScheduledActionCancelled => "scheduled_action_cancelled",
            Self::AiReplySent => "ai_reply_sent",
            Self::AiReplyFailed => "ai_reply_failed",
            Self::AiSettingsUpdated => "ai_settings_updated",
            Self::HandoffTriggered => "handoff_triggered",
            Self::HandoffReset => "handoff_reset",
            Self::ThreadAiToggled => "thread_ai_toggled",
            Self::SlaEscalated => "sla_escalated",
            Self::InboundEventFailed => "inbound_event_failed",
        };
        write!(f, "{}", s)
    }
}

/// Resource types for audit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Thread,
    AutomationRule,
    ScheduledAction,
    AiSettings,
    InboundEvent,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Thread => "thread",
            Self::AutomationRule => "automation_rule",
            Self::ScheduledAction => "scheduled_action",
            Self::AiSettings => "ai_settings",
            Self::InboundEvent => "inbound_event",
        };
        write!(f, "{}", s)
    }
}

/// Who performed an audited action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    System,
    User(Uuid),
    Rule(Uuid),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User(id) => write!(f, "user:{}", id),
            Self::Rule(id) => write!(f, "rule:{}", id),
        }
    }
}

/// DTO for creating audit log
#[derive(Debug, Clone)]
pub struct CreateAuditLog {
    pub workspace_id: Uuid,
    pub actor: Actor,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub details: Option<Value>,
}

impl CreateAuditLog {
    pub fn into_log(self) -> AuditLog {
        AuditLog {
            id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
            actor: self.actor.to_string(),
            action: self.action.to_string(),
            resource_type: self.resource_type.to_string(),
            resource_id: self.resource_id,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}
