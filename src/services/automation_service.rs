//! Trigger/condition/action rule engine.
//!
//! `evaluate` is pure: it selects the enabled rules for an event's trigger,
//! orders them by descending priority and keeps those whose conditions all
//! hold. `AutomationEngine` executes the resulting plans against the store.
//! Conditions are re-checked against a freshly loaded thread immediately
//! before every action, so an earlier rule can invalidate a later one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::RegexBuilder;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::ActionError,
    models::{
        Action, ActionOutcome, Actor, Agent, AssignmentStrategy, AuditAction, AutomationRule,
        Condition, CreateAuditLog, ExecutionPlan, HandoffState, ResourceType, RuleEvent,
        RuleExecution, RuleState, ScheduledAction, Thread, ThreadField, TimeReference, Trigger,
    },
    services::{audit_service::AuditService, channel_service::MessageSender},
    store::Store,
};

/// Rule actions can raise `tag_added` / `status_changed` events that are fed
/// back into the engine. Chains stop at this depth.
pub const MAX_CHAIN_DEPTH: usize = 3;

const MAX_PATTERN_LEN: usize = 512;

/// Select and order the rules that match `event` on `thread`
pub fn evaluate(
    event: &RuleEvent,
    thread: &Thread,
    rules: &[AutomationRule],
    now: DateTime<Utc>,
) -> Vec<ExecutionPlan> {
    let mut candidates: Vec<&AutomationRule> = rules
        .iter()
        .filter(|r| r.enabled)
        .filter(|r| r.workspace_id == event.workspace_id && r.workspace_id == thread.workspace_id)
        .filter(|r| r.trigger == event.trigger)
        .collect();

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    candidates
        .into_iter()
        .filter(|rule| conditions_hold(&rule.conditions, event, thread, now))
        .map(|rule| ExecutionPlan {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            priority: rule.priority,
            conditions: rule.conditions.clone(),
            actions: rule.actions.clone(),
        })
        .collect()
}

/// Conjunction of every condition. An empty list holds.
pub fn conditions_hold(conditions: &[Condition], event: &RuleEvent, thread: &Thread, now: DateTime<Utc>) -> bool {
    conditions
        .iter()
        .all(|condition| condition_matches(condition, event, thread, now))
}

pub fn condition_matches(condition: &Condition, event: &RuleEvent, thread: &Thread, now: DateTime<Utc>) -> bool {
    match condition {
        Condition::HasTag { tag } => thread.has_tag(tag),
        Condition::LacksTag { tag } => !thread.has_tag(tag),
        Condition::TimeElapsed { since, minutes } => {
            let reference = match since {
                TimeReference::Event => Some(event.occurred_at),
                TimeReference::LastCustomerMessage => thread.last_customer_message_at,
                TimeReference::LastAgentReply => thread.last_agent_reply_at,
            };
            reference.is_some_and(|at| now - at >= Duration::minutes(*minutes))
        }
        Condition::FieldEquals { field, value } => field_value(thread, *field).as_deref() == Some(value.as_str()),
        Condition::StatusEquals { status } => thread.status == *status,
        Condition::PriorityEquals { priority } => thread.priority == *priority,
        Condition::MessageContains { keywords } => {
            let Some(text) = event.message_text.as_deref() else {
                return false;
            };
            let text = text.to_lowercase();
            keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .any(|k| text.contains(&k.to_lowercase()))
        }
        Condition::MessageMatches { pattern } => {
            let Some(text) = event.message_text.as_deref() else {
                return false;
            };
            match RegexBuilder::new(pattern).size_limit(1 << 20).build() {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    tracing::warn!(%pattern, error = %e, "Ignoring invalid message_matches pattern");
                    false
                }
            }
        }
    }
}

fn field_value(thread: &Thread, field: ThreadField) -> Option<String> {
    match field {
        ThreadField::Channel => Some(thread.channel.to_string()),
        ThreadField::ContactName => thread.contact_name.clone(),
        ThreadField::ExternalId => Some(thread.external_id.clone()),
        ThreadField::AccountId => Some(thread.account_id.clone()),
        ThreadField::AssignedAgentId => thread.assigned_agent_id.map(|id| id.to_string()),
    }
}

/// Reject rule definitions that can never evaluate sensibly
pub fn validate_rule_definition(conditions: &[Condition], actions: &[Action]) -> Result<(), String> {
    for condition in conditions {
        match condition {
            Condition::TimeElapsed { minutes, .. } if *minutes < 0 => {
                return Err("time_elapsed minutes must not be negative".to_string());
            }
            Condition::MessageContains { keywords } if keywords.iter().all(|k| k.trim().is_empty()) => {
                return Err("message_contains needs at least one keyword".to_string());
            }
            Condition::MessageMatches { pattern } => {
                if pattern.len() > MAX_PATTERN_LEN {
                    return Err("message_matches pattern is too long".to_string());
                }
                RegexBuilder::new(pattern)
                    .size_limit(1 << 20)
                    .build()
                    .map_err(|e| format!("invalid message_matches pattern: {e}"))?;
            }
            _ => {}
        }
    }

    for action in actions {
        match action {
            Action::ApplyTag { tag } if tag.trim().is_empty() => {
                return Err("apply_tag needs a tag".to_string());
            }
            Action::SendMessage { text, delay_minutes } => {
                if text.trim().is_empty() {
                    return Err("send_message needs text".to_string());
                }
                if *delay_minutes < 0 {
                    return Err("send_message delay must not be negative".to_string());
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Choose an agent. Round-robin walks the id-ordered list with a shared
/// cursor; load-based takes the fewest open threads, ties broken by id.
pub fn pick_agent(agents: &[Agent], strategy: AssignmentStrategy, cursor: u64) -> Option<&Agent> {
    if agents.is_empty() {
        return None;
    }
    match strategy {
        AssignmentStrategy::RoundRobin => {
            let mut ordered: Vec<&Agent> = agents.iter().collect();
            ordered.sort_by_key(|a| a.id);
            let index = (cursor % ordered.len() as u64) as usize;
            Some(ordered[index])
        }
        AssignmentStrategy::LoadBased => agents.iter().min_by_key(|a| (a.open_threads, a.id)),
    }
}

/// Clock for condition checks. Sweeps may carry a time ahead of the wall clock.
fn evaluation_time(event: &RuleEvent) -> DateTime<Utc> {
    event.occurred_at.max(Utc::now())
}

/// Executes matched plans. Cheap to clone.
#[derive(Clone)]
pub struct AutomationEngine {
    store: Arc<dyn Store>,
    audit: AuditService,
    sender: Arc<dyn MessageSender>,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Store>, audit: AuditService, sender: Arc<dyn MessageSender>) -> Self {
        Self { store, audit, sender }
    }

    /// Evaluate and execute rules for `event`, then any events raised by the
    /// executed actions. A rule failure is audited and never stops later rules.
    pub async fn handle_event(&self, event: RuleEvent) -> Result<Vec<RuleExecution>, ActionError> {
        let mut queue = VecDeque::from([(event, 0usize)]);
        let mut executions = Vec::new();

        while let Some((event, depth)) = queue.pop_front() {
            let (mut ran, raised) = self.run_once(&event).await?;
            executions.append(&mut ran);

            if depth + 1 >= MAX_CHAIN_DEPTH {
                if !raised.is_empty() {
                    tracing::warn!(
                        workspace_id = %event.workspace_id,
                        thread_id = %event.thread_id,
                        dropped = raised.len(),
                        "Automation chain depth limit reached"
                    );
                }
                continue;
            }
            queue.extend(raised.into_iter().map(|e| (e, depth + 1)));
        }

        Ok(executions)
    }

    /// Sweep open threads of every workspace that has `time_elapsed` rules.
    /// A rule fires at most once per thread per customer message.
    pub async fn run_time_elapsed_sweep(&self, now: DateTime<Utc>, limit: i64) -> Result<usize, ActionError> {
        let rules = self.store.list_enabled_rules_for_trigger(Trigger::TimeElapsed).await?;
        let mut by_workspace: HashMap<Uuid, usize> = HashMap::new();
        for rule in &rules {
            *by_workspace.entry(rule.workspace_id).or_default() += 1;
        }

        let mut fired = 0;
        for workspace_id in by_workspace.into_keys() {
            let threads = self.store.list_open_threads(workspace_id, limit).await?;
            for thread in threads {
                let event = RuleEvent::time_elapsed(workspace_id, thread.id, now);
                match self.handle_event(event).await {
                    Ok(executions) => fired += executions.len(),
                    Err(e) => tracing::error!(
                        %workspace_id,
                        thread_id = %thread.id,
                        error = %e,
                        "time_elapsed sweep failed for thread"
                    ),
                }
            }
        }
        Ok(fired)
    }

    async fn run_once(&self, event: &RuleEvent) -> Result<(Vec<RuleExecution>, Vec<RuleEvent>), ActionError> {
        let thread = self.store.get_thread(event.workspace_id, event.thread_id).await?;
        let rules = self.store.list_rules(event.workspace_id).await?;
        let plans = evaluate(event, &thread, &rules, evaluation_time(event));

        let mut executions = Vec::with_capacity(plans.len());
        let mut raised = Vec::new();

        for plan in plans {
            if event.trigger == Trigger::TimeElapsed {
                let anchor = thread.last_customer_message_at.unwrap_or(thread.created_at);
                match self
                    .store
                    .record_rule_firing_if_absent(plan.rule_id, thread.id, anchor)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    // Not fired; the next sweep tries this rule again
                    Err(e) => {
                        tracing::error!(
                            workspace_id = %event.workspace_id,
                            thread_id = %thread.id,
                            rule_id = %plan.rule_id,
                            error = %e,
                            "Failed to record rule firing"
                        );
                        continue;
                    }
                }
            }

            tracing::debug!(
                workspace_id = %event.workspace_id,
                thread_id = %event.thread_id,
                rule_id = %plan.rule_id,
                trigger = %event.trigger,
                "Automation rule matched"
            );
            let execution = self.execute_plan(event, &plan, &mut raised).await;
            executions.push(execution);
        }

        Ok((executions, raised))
    }

    async fn execute_plan(&self, event: &RuleEvent, plan: &ExecutionPlan, raised: &mut Vec<RuleEvent>) -> RuleExecution {
        let mut state = RuleState::Executing;
        let mut outcomes = Vec::with_capacity(plan.actions.len());

        for action in &plan.actions {
            let thread = match self.store.get_thread(event.workspace_id, event.thread_id).await {
                Ok(thread) => thread,
                Err(e) => {
                    outcomes.push(ActionOutcome::Failed {
                        action: action.kind().to_string(),
                        error: e.to_string(),
                    });
                    state = RuleState::Failed;
                    break;
                }
            };

            if !conditions_hold(&plan.conditions, event, &thread, evaluation_time(event)) {
                tracing::debug!(
                    rule_id = %plan.rule_id,
                    action = action.kind(),
                    "Skipping action, rule conditions no longer hold"
                );
                outcomes.push(ActionOutcome::SkippedStale {
                    action: action.kind().to_string(),
                });
                continue;
            }

            match self.apply(plan.rule_id, &thread, action, raised).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let error = ActionError::RuleExecutionFailed {
                        rule_id: plan.rule_id,
                        action: action.kind().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::error!(
                        workspace_id = %event.workspace_id,
                        thread_id = %event.thread_id,
                        rule_id = %plan.rule_id,
                        error = %error,
                        "Automation action failed"
                    );
                    self.audit
                        .log_rule_failure(event.workspace_id, plan.rule_id, event.thread_id, action.kind(), &e.to_string())
                        .await;
                    outcomes.push(ActionOutcome::Failed {
                        action: action.kind().to_string(),
                        error: e.to_string(),
                    });
                    state = RuleState::Failed;
                    break;
                }
            }
        }

        if state == RuleState::Executing {
            state = RuleState::Succeeded;
            self.audit
                .record(CreateAuditLog {
                    workspace_id: event.workspace_id,
                    actor: Actor::Rule(plan.rule_id),
                    action: AuditAction::RuleExecuted,
                    resource_type: ResourceType::Thread,
                    resource_id: Some(event.thread_id.to_string()),
                    details: Some(json!({
                        "rule_name": plan.rule_name,
                        "trigger": event.trigger,
                        "outcomes": outcomes,
                    })),
                })
                .await;
        }

        RuleExecution {
            rule_id: plan.rule_id,
            state,
            outcomes,
        }
    }

    async fn apply(
        &self,
        rule_id: Uuid,
        thread: &Thread,
        action: &Action,
        raised: &mut Vec<RuleEvent>,
    ) -> Result<ActionOutcome, ActionError> {
        if let Some(delay) = action.deferral() {
            let scheduled = ScheduledAction::new(
                thread.workspace_id,
                Some(thread.id),
                Some(rule_id),
                Utc::now() + Duration::minutes(delay),
                action.clone(),
            );
            self.store.insert_scheduled_action(&scheduled).await?;
            self.audit
                .record(CreateAuditLog {
                    workspace_id: thread.workspace_id,
                    actor: Actor::Rule(rule_id),
                    action: AuditAction::ActionScheduled,
                    resource_type: ResourceType::ScheduledAction,
                    resource_id: Some(scheduled.id.to_string()),
                    details: Some(json!({ "run_at": scheduled.run_at, "action": action.kind() })),
                })
                .await;
            return Ok(ActionOutcome::Scheduled {
                action: action.kind().to_string(),
                scheduled_action_id: scheduled.id,
            });
        }

        self.apply_now(thread, action, Some(raised)).await?;
        Ok(ActionOutcome::Applied {
            action: action.kind().to_string(),
        })
    }

    /// Apply an action immediately, ignoring any deferral. Used for rule
    /// actions and for due scheduled actions. Chained events are only
    /// collected when `raised` is given.
    pub async fn apply_now(
        &self,
        thread: &Thread,
        action: &Action,
        raised: Option<&mut Vec<RuleEvent>>,
    ) -> Result<(), ActionError> {
        let ws = thread.workspace_id;
        let now = Utc::now();

        match action {
            Action::ApplyTag { tag } => {
                let (_, added) = self.store.add_tag(ws, thread.id, tag).await?;
                if let (true, Some(raised)) = (added, raised) {
                    raised.push(RuleEvent::tag_added(ws, thread.id, tag, now));
                }
            }
            Action::ChangeStatus { status } => {
                let (_, previous) = self.store.set_status(ws, thread.id, *status).await?;
                if let (true, Some(raised)) = (previous != *status, raised) {
                    raised.push(RuleEvent::status_changed(ws, thread.id, previous, now));
                }
            }
            Action::AssignAgent { strategy } => {
                let agents = self.store.list_agents(ws).await?;
                let cursor = match strategy {
                    AssignmentStrategy::RoundRobin => self.store.next_assignment_cursor(ws).await?,
                    AssignmentStrategy::LoadBased => 0,
                };
                let agent = pick_agent(&agents, *strategy, cursor).ok_or_else(|| ActionError::Failed {
                    action: action.kind().to_string(),
                    reason: "workspace has no active agents".to_string(),
                })?;
                self.store.assign_agent(ws, thread.id, agent.id).await?;

                let ai_state = self.store.get_thread_ai_state(ws, thread.id).await?;
                if ai_state.handoff == HandoffState::Pending {
                    self.store
                        .set_handoff(ws, thread.id, HandoffState::HandedOff, ai_state.handoff_reason.as_deref(), now)
                        .await?;
                }
            }
            Action::SendMessage { text, .. } => {
                self.sender
                    .send_text(thread, text)
                    .await
                    .map_err(|e| ActionError::Failed {
                        action: action.kind().to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Action::TriggerHandoff { reason } => {
                let current = self.store.get_thread_ai_state(ws, thread.id).await?;
                if !current.handoff.is_active() {
                    self.store
                        .set_handoff(ws, thread.id, HandoffState::Pending, reason.as_deref(), now)
                        .await?;
                }
            }
        }

        Ok(())
    }
}
