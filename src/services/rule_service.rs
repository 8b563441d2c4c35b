use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        Action, Actor, AuditAction, AutomationRule, Condition, CreateAuditLog, CreateAutomationRule,
        ResourceType, UpdateAutomationRule,
    },
    services::{audit_service::AuditService, automation_service::validate_rule_definition},
    store::Store,
    utils::{normalize_tag, sanitize_name},
};

/// Workspace-scoped CRUD over automation rules
#[derive(Clone)]
pub struct RuleService {
    store: Arc<dyn Store>,
    audit: AuditService,
}

impl RuleService {
    pub fn new(store: Arc<dyn Store>, audit: AuditService) -> Self {
        Self { store, audit }
    }

    pub async fn list(&self, workspace_id: Uuid) -> AppResult<Vec<AutomationRule>> {
        Ok(self.store.list_rules(workspace_id).await?)
    }

    pub async fn get(&self, workspace_id: Uuid, rule_id: Uuid) -> AppResult<AutomationRule> {
        Ok(self.store.get_rule(workspace_id, rule_id).await?)
    }

    pub async fn create(&self, workspace_id: Uuid, actor: Actor, data: CreateAutomationRule) -> AppResult<AutomationRule> {
        let conditions = normalize_conditions(data.conditions);
        let actions = normalize_actions(data.actions);
        validate_rule_definition(&conditions, &actions).map_err(AppError::Validation)?;

        let now = Utc::now();
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            workspace_id,
            name: sanitize_name(&data.name),
            trigger: data.trigger,
            conditions,
            actions,
            enabled: data.enabled,
            priority: data.priority,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_rule(&rule).await?;

        tracing::info!(%workspace_id, rule_id = %rule.id, trigger = %rule.trigger, "Automation rule created");
        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::RuleCreated,
                resource_type: ResourceType::AutomationRule,
                resource_id: Some(rule.id.to_string()),
                details: Some(json!({ "name": rule.name, "trigger": rule.trigger })),
            })
            .await;
        Ok(rule)
    }

    pub async fn update(
        &self,
        workspace_id: Uuid,
        rule_id: Uuid,
        actor: Actor,
        data: UpdateAutomationRule,
    ) -> AppResult<AutomationRule> {
        let mut rule = self.store.get_rule(workspace_id, rule_id).await?;

        if let Some(name) = data.name {
            rule.name = sanitize_name(&name);
        }
        if let Some(trigger) = data.trigger {
            rule.trigger = trigger;
        }
        if let Some(conditions) = data.conditions {
            rule.conditions = normalize_conditions(conditions);
        }
        if let Some(actions) = data.actions {
            rule.actions = normalize_actions(actions);
        }
        if let Some(enabled) = data.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = data.priority {
            rule.priority = priority;
        }
        validate_rule_definition(&rule.conditions, &rule.actions).map_err(AppError::Validation)?;
        rule.updated_at = Utc::now();

        self.store.update_rule(&rule).await?;
        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::RuleUpdated,
                resource_type: ResourceType::AutomationRule,
                resource_id: Some(rule.id.to_string()),
                details: Some(json!({ "enabled": rule.enabled, "priority": rule.priority })),
            })
            .await;
        Ok(rule)
    }

    pub async fn delete(&self, workspace_id: Uuid, rule_id: Uuid, actor: Actor) -> AppResult<()> {
        self.store.delete_rule(workspace_id, rule_id).await?;
        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::RuleDeleted,
                resource_type: ResourceType::AutomationRule,
                resource_id: Some(rule_id.to_string()),
                details: None,
            })
            .await;
        Ok(())
    }
}

fn normalize_conditions(conditions: Vec<Condition>) -> Vec<Condition> {
    conditions
        .into_iter()
        .map(|c| match c {
            Condition::HasTag { tag } => Condition::HasTag { tag: normalize_tag(&tag) },
            Condition::LacksTag { tag } => Condition::LacksTag { tag: normalize_tag(&tag) },
            other => other,
        })
        .collect()
}

fn normalize_actions(actions: Vec<Action>) -> Vec<Action> {
    actions
        .into_iter()
        .map(|a| match a {
            Action::ApplyTag { tag } => Action::ApplyTag { tag: normalize_tag(&tag) },
            other => other,
        })
        .collect()
}
