use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::StoreResult,
    models::{Actor, AuditAction, AuditLog, CreateAuditLog, ResourceType},
    store::Store,
};

/// Append-only audit trail for automation, scheduling and AI decisions
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn Store>,
}

impl AuditService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Log an audit event
    pub async fn log(&self, entry: CreateAuditLog) -> StoreResult<AuditLog> {
        let log = entry.into_log();
        self.store.append_audit(&log).await?;
        Ok(log)
    }

    /// Log an audit event from a background path. Failures are reported
    /// through tracing and never abort the caller.
    pub async fn record(&self, entry: CreateAuditLog) {
        let action = entry.action;
        if let Err(e) = self.log(entry).await {
            tracing::warn!(%action, error = %e, "Failed to write audit log");
        }
    }

    pub async fn list(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AuditLog>> {
        let (limit, offset) = clamp_audit_page_params(limit, offset);
        self.store.list_audit(workspace_id, limit, offset).await
    }

    pub async fn log_rule_failure(&self, workspace_id: Uuid, rule_id: Uuid, thread_id: Uuid, action: &str, error: &str) {
        self.record(CreateAuditLog {
            workspace_id,
            actor: Actor::Rule(rule_id),
            action: AuditAction::RuleExecutionFailed,
            resource_type: ResourceType::Thread,
            resource_id: Some(thread_id.to_string()),
            details: Some(build_failure_details(action, error)),
        })
        .await;
    }
}

// ---- Pure helper functions (testable without DB) ----

/// Details payload for a failed action
pub fn build_failure_details(action: &str, error: &str) -> serde_json::Value {
    serde_json::json!({
        "action": action,
        "error": error
    })
}

/// Return whether an audit action records a failure
pub fn is_failure(action: &AuditAction) -> bool {
    matches!(
        action,
        AuditAction::RuleExecutionFailed
            | AuditAction::ScheduledActionFailed
            | AuditAction::AiReplyFailed
            | AuditAction::InboundEventFailed
    )
}

/// Validate pagination parameters and clamp to safe range
pub fn clamp_audit_page_params(limit: i64, offset: i64) -> (i64, i64) {
    let safe_limit = limit.clamp(1, 1000);
    let safe_offset = offset.max(0);
    (safe_limit, safe_offset)
}
