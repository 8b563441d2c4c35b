//! `Store` wrapper that fails chosen operations on demand.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use inboxpilot::{
    error::{StoreError, StoreResult},
    models::{
        AIReplyLog, AIReplySettings, Agent, AuditLog, AutomationRule, Escalation, HandoffState,
        InboundEvent, ScheduledAction, ScheduledActionStatus, Thread, ThreadAIState, ThreadKey,
        ThreadStatus, Trigger, UsageDelta, UsageRecord,
    },
    store::{MemoryStore, Store},
};

/// Delegates to a `MemoryStore`; an armed operation returns a database
/// error instead of running.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    // op name -> failures left
    faults: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Fail `op` until `heal` is called
    pub fn fail(&self, op: &'static str) {
        self.fail_times(op, usize::MAX);
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_times(&self, op: &'static str, times: usize) {
        self.faults.lock().unwrap().insert(op, times);
    }

    pub fn heal(&self, op: &'static str) {
        self.faults.lock().unwrap().remove(op);
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Database(sqlx::Error::PoolTimedOut))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check("ping")?;
        self.inner.ping().await
    }

    async fn workspace_for_account(&self, account_id: &str) -> StoreResult<Option<Uuid>> {
        self.check("workspace_for_account")?;
        self.inner.workspace_for_account(account_id).await
    }

    async fn claim_event(&self, event: &InboundEvent, lease: Duration) -> StoreResult<Option<i32>> {
        self.check("claim_event")?;
        self.inner.claim_event(event, lease).await
    }

    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<(InboundEvent, i32)>> {
        self.check("claim_due_events")?;
        self.inner.claim_due_events(now, limit, lease).await
    }

    async fn mark_event_processed(&self, workspace_id: Uuid, external_message_id: &str) -> StoreResult<()> {
        self.check("mark_event_processed")?;
        self.inner.mark_event_processed(workspace_id, external_message_id).await
    }

    async fn defer_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.check("defer_event")?;
        self.inner
            .defer_event(workspace_id, external_message_id, attempt, retry_at, error)
            .await
    }

    async fn fail_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        error: &str,
    ) -> StoreResult<()> {
        self.check("fail_event")?;
        self.inner
            .fail_event(workspace_id, external_message_id, attempt, error)
            .await
    }

    async fn get_or_create_thread(&self, key: &ThreadKey) -> StoreResult<Thread> {
        self.check("get_or_create_thread")?;
        self.inner.get_or_create_thread(key).await
    }

    async fn get_thread(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<Thread> {
        self.check("get_thread")?;
        self.inner.get_thread(workspace_id, thread_id).await
    }

    async fn record_customer_message(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
        text: Option<&str>,
    ) -> StoreResult<Thread> {
        self.check("record_customer_message")?;
        self.inner
            .record_customer_message(workspace_id, thread_id, at, text)
            .await
    }

    async fn set_first_response_at_if_null(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        self.check("set_first_response_at_if_null")?;
        self.inner
            .set_first_response_at_if_null(workspace_id, thread_id, at)
            .await
    }

    async fn record_agent_reply(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Thread> {
        self.check("record_agent_reply")?;
        self.inner.record_agent_reply(workspace_id, thread_id, at).await
    }

    async fn add_tag(&self, workspace_id: Uuid, thread_id: Uuid, tag: &str) -> StoreResult<(Thread, bool)> {
        self.check("add_tag")?;
        self.inner.add_tag(workspace_id, thread_id, tag).await
    }

    async fn set_status(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        status: ThreadStatus,
    ) -> StoreResult<(Thread, ThreadStatus)> {
        self.check("set_status")?;
        self.inner.set_status(workspace_id, thread_id, status).await
    }

    async fn assign_agent(&self, workspace_id: Uuid, thread_id: Uuid, agent_id: Uuid) -> StoreResult<Thread> {
        self.check("assign_agent")?;
        self.inner.assign_agent(workspace_id, thread_id, agent_id).await
    }

    async fn set_thread_ai_enabled(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        enabled: bool,
    ) -> StoreResult<Thread> {
        self.check("set_thread_ai_enabled")?;
        self.inner
            .set_thread_ai_enabled(workspace_id, thread_id, enabled)
            .await
    }

    async fn list_threads_awaiting_response(&self, limit: i64) -> StoreResult<Vec<Thread>> {
        self.check("list_threads_awaiting_response")?;
        self.inner.list_threads_awaiting_response(limit).await
    }

    async fn list_open_threads(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Thread>> {
        self.check("list_open_threads")?;
        self.inner.list_open_threads(workspace_id, limit).await
    }

    async fn list_agents(&self, workspace_id: Uuid) -> StoreResult<Vec<Agent>> {
        self.check("list_agents")?;
        self.inner.list_agents(workspace_id).await
    }

    async fn next_assignment_cursor(&self, workspace_id: Uuid) -> StoreResult<u64> {
        self.check("next_assignment_cursor")?;
        self.inner.next_assignment_cursor(workspace_id).await
    }

    async fn list_rules(&self, workspace_id: Uuid) -> StoreResult<Vec<AutomationRule>> {
        self.check("list_rules")?;
        self.inner.list_rules(workspace_id).await
    }

    async fn list_enabled_rules_for_trigger(&self, trigger: Trigger) -> StoreResult<Vec<AutomationRule>> {
        self.check("list_enabled_rules_for_trigger")?;
        self.inner.list_enabled_rules_for_trigger(trigger).await
    }

    async fn get_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<AutomationRule> {
        self.check("get_rule")?;
        self.inner.get_rule(workspace_id, rule_id).await
    }

    async fn insert_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        self.check("insert_rule")?;
        self.inner.insert_rule(rule).await
    }

    async fn update_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        self.check("update_rule")?;
        self.inner.update_rule(rule).await
    }

    async fn delete_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<()> {
        self.check("delete_rule")?;
        self.inner.delete_rule(workspace_id, rule_id).await
    }

    async fn record_rule_firing_if_absent(
        &self,
        rule_id: Uuid,
        thread_id: Uuid,
        anchor: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check("record_rule_firing_if_absent")?;
        self.inner
            .record_rule_firing_if_absent(rule_id, thread_id, anchor)
            .await
    }

    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> StoreResult<()> {
        self.check("insert_scheduled_action")?;
        self.inner.insert_scheduled_action(action).await
    }

    async fn get_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        self.check("get_scheduled_action")?;
        self.inner.get_scheduled_action(workspace_id, id).await
    }

    async fn list_scheduled_actions(
        &self,
        workspace_id: Uuid,
        status: Option<ScheduledActionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScheduledAction>> {
        self.check("list_scheduled_actions")?;
        self.inner
            .list_scheduled_actions(workspace_id, status, limit, offset)
            .await
    }

    async fn cancel_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        self.check("cancel_scheduled_action")?;
        self.inner.cancel_scheduled_action(workspace_id, id).await
    }

    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<ScheduledAction>> {
        self.check("claim_due_actions")?;
        self.inner.claim_due_actions(now, limit, lease).await
    }

    async fn mark_action_executed(&self, id: Uuid) -> StoreResult<bool> {
        self.check("mark_action_executed")?;
        self.inner.mark_action_executed(id).await
    }

    async fn mark_action_retry(
        &self,
        id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.check("mark_action_retry")?;
        self.inner.mark_action_retry(id, attempt, run_at, error).await
    }

    async fn mark_action_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<()> {
        self.check("mark_action_failed")?;
        self.inner.mark_action_failed(id, attempt, error).await
    }

    async fn get_ai_settings(&self, workspace_id: Uuid) -> StoreResult<AIReplySettings> {
        self.check("get_ai_settings")?;
        self.inner.get_ai_settings(workspace_id).await
    }

    async fn upsert_ai_settings(&self, settings: &AIReplySettings) -> StoreResult<()> {
        self.check("upsert_ai_settings")?;
        self.inner.upsert_ai_settings(settings).await
    }

    async fn get_thread_ai_state(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<ThreadAIState> {
        self.check("get_thread_ai_state")?;
        self.inner.get_thread_ai_state(workspace_id, thread_id).await
    }

    async fn set_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        state: HandoffState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ThreadAIState> {
        self.check("set_handoff")?;
        self.inner
            .set_handoff(workspace_id, thread_id, state, reason, at)
            .await
    }

    async fn record_ai_reply(&self, workspace_id: Uuid, thread_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.check("record_ai_reply")?;
        self.inner.record_ai_reply(workspace_id, thread_id, at).await
    }

    async fn append_ai_log(&self, log: &AIReplyLog) -> StoreResult<()> {
        self.check("append_ai_log")?;
        self.inner.append_ai_log(log).await
    }

    async fn list_ai_logs(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AIReplyLog>> {
        self.check("list_ai_logs")?;
        self.inner.list_ai_logs(workspace_id, limit, offset).await
    }

    async fn accumulate_usage(&self, workspace_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> StoreResult<()> {
        self.check("accumulate_usage")?;
        self.inner.accumulate_usage(workspace_id, day, delta).await
    }

    async fn usage_between(&self, workspace_id: Uuid, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<UsageRecord>> {
        self.check("usage_between")?;
        self.inner.usage_between(workspace_id, from, to).await
    }

    async fn tokens_since(&self, workspace_id: Uuid, from: NaiveDate) -> StoreResult<i64> {
        self.check("tokens_since")?;
        self.inner.tokens_since(workspace_id, from).await
    }

    async fn append_audit(&self, log: &AuditLog) -> StoreResult<()> {
        self.check("append_audit")?;
        self.inner.append_audit(log).await
    }

    async fn list_audit(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AuditLog>> {
        self.check("list_audit")?;
        self.inner.list_audit(workspace_id, limit, offset).await
    }

    async fn record_escalation_if_absent(&self, escalation: &Escalation) -> StoreResult<bool> {
        self.check("record_escalation_if_absent")?;
        self.inner.record_escalation_if_absent(escalation).await
    }

    async fn list_escalations(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Escalation>> {
        self.check("list_escalations")?;
        self.inner.list_escalations(workspace_id, limit).await
    }
}
