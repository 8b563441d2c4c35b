use std::collections::{hash_map::Entry, BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::{
    error::{StoreError, StoreResult},
    models::{
        AIReplyLog, AIReplySettings, Agent, AuditLog, AutomationRule, Channel, Escalation,
        EscalationKey, HandoffState, InboundEvent, ProviderUsage, ScheduledAction,
        ScheduledActionStatus, Thread, ThreadAIState, ThreadKey, ThreadStatus, Trigger, UsageDelta,
        UsageRecord,
    },
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Uuid>,
    events: HashMap<(Uuid, String), EventRecord>,
    threads: HashMap<Uuid, Thread>,
    thread_index: HashMap<(Uuid, Channel, String), Uuid>,
    agents: BTreeMap<Uuid, Agent>,
    cursors: HashMap<Uuid, u64>,
    rules: HashMap<Uuid, AutomationRule>,
    firings: HashSet<(Uuid, Uuid, DateTime<Utc>)>,
    actions: HashMap<Uuid, LeasedAction>,
    ai_settings: HashMap<Uuid, AIReplySettings>,
    ai_state: HashMap<Uuid, ThreadAIState>,
    ai_logs: Vec<AIReplyLog>,
    usage: BTreeMap<(Uuid, NaiveDate, String), ProviderUsage>,
    audit: Vec<AuditLog>,
    escalation_keys: HashSet<EscalationKey>,
    escalations: Vec<Escalation>,
}

struct EventRecord {
    event: InboundEvent,
    attempts: i32,
    locked_until: DateTime<Utc>,
    retry_at: Option<DateTime<Utc>>,
    processed: bool,
    last_error: Option<String>,
}

impl EventRecord {
    fn due_at(&self) -> DateTime<Utc> {
        self.retry_at.unwrap_or(self.locked_until)
    }
}

struct LeasedAction {
    action: ScheduledAction,
    locked_until: Option<DateTime<Utc>>,
}

impl Inner {
    fn thread_mut(&mut self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<&mut Thread> {
        self.threads
            .get_mut(&thread_id)
            .filter(|t| t.workspace_id == workspace_id)
            .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))
    }

    fn event_mut(&mut self, workspace_id: Uuid, external_message_id: &str) -> StoreResult<&mut EventRecord> {
        self.events
            .get_mut(&(workspace_id, external_message_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("event {external_message_id}")))
    }

    fn open_threads_for(&self, agent_id: Uuid) -> i64 {
        self.threads
            .values()
            .filter(|t| t.assigned_agent_id == Some(agent_id) && t.status == ThreadStatus::Open)
            .count() as i64
    }
}

/// In-process store behind a single `RwLock`. Each trait method takes the
/// lock once, so conditional writes are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a business account to a workspace
    pub async fn register_account(&self, account_id: &str, workspace_id: Uuid) {
        self.inner
            .write()
            .await
            .accounts
            .insert(account_id.to_string(), workspace_id);
    }

    pub async fn add_agent(&self, workspace_id: Uuid, name: &str) -> Agent {
        let agent = Agent {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.to_string(),
            active: true,
            open_threads: 0,
        };
        self.inner.write().await.agents.insert(agent.id, agent.clone());
        agent
    }

    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Last processing error recorded for an event
    pub async fn event_error(&self, workspace_id: Uuid, external_message_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .events
            .get(&(workspace_id, external_message_id.to_string()))
            .and_then(|r| r.last_error.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn workspace_for_account(&self, account_id: &str) -> StoreResult<Option<Uuid>> {
        Ok(self.inner.read().await.accounts.get(account_id).copied())
    }

    async fn claim_event(&self, event: &InboundEvent, lease: Duration) -> StoreResult<Option<i32>> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let key = (event.workspace_id, event.external_message_id.clone());

        match inner.events.entry(key) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.processed || record.locked_until > now {
                    return Ok(None);
                }
                record.locked_until = now + lease;
                Ok(Some(record.attempts + 1))
            }
            Entry::Vacant(slot) => {
                slot.insert(EventRecord {
                    event: event.clone(),
                    attempts: 0,
                    locked_until: now + lease,
                    retry_at: None,
                    processed: false,
                    last_error: None,
                });
                Ok(Some(1))
            }
        }
    }

    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<(InboundEvent, i32)>> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<&mut EventRecord> = inner
            .events
            .values_mut()
            .filter(|r| !r.processed && r.locked_until <= now && r.due_at() <= now)
            .collect();
        due.sort_by_key(|r| r.due_at());

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| {
                r.locked_until = now + lease;
                (r.event.clone(), r.attempts + 1)
            })
            .collect())
    }

    async fn mark_event_processed(&self, workspace_id: Uuid, external_message_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner.event_mut(workspace_id, external_message_id)?;
        record.processed = true;
        record.retry_at = None;
        Ok(())
    }

    async fn defer_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner.event_mut(workspace_id, external_message_id)?;
        record.attempts = attempt;
        record.locked_until = Utc::now();
        record.retry_at = Some(retry_at);
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner.event_mut(workspace_id, external_message_id)?;
        record.attempts = attempt;
        record.processed = true;
        record.retry_at = None;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get_or_create_thread(&self, key: &ThreadKey) -> StoreResult<Thread> {
        let mut inner = self.inner.write().await;
        let index_key = (key.workspace_id, key.channel, key.external_id.clone());

        if let Some(id) = inner.thread_index.get(&index_key).copied() {
            let thread = inner.thread_mut(key.workspace_id, id)?;
            if thread.contact_name.is_none() && key.contact_name.is_some() {
                thread.contact_name = key.contact_name.clone();
                thread.updated_at = Utc::now();
            }
            return Ok(thread.clone());
        }

        let mut thread = Thread::new(key.workspace_id, key.channel, &key.external_id, &key.account_id);
        thread.contact_name = key.contact_name.clone();
        inner.thread_index.insert(index_key, thread.id);
        inner.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<Thread> {
        self.inner
            .read()
            .await
            .threads
            .get(&thread_id)
            .filter(|t| t.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))
    }

    async fn record_customer_message(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
        text: Option<&str>,
    ) -> StoreResult<Thread> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        if thread.last_customer_message_at.map_or(true, |prev| at > prev) {
            thread.last_customer_message_at = Some(at);
            if let Some(text) = text {
                thread.last_message_text = Some(text.to_string());
            }
        }
        thread.unread_count += 1;
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }

    async fn set_first_response_at_if_null(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        let stored = *thread.first_response_at.get_or_insert(at);
        Ok(stored)
    }

    async fn record_agent_reply(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Thread> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        if thread.last_agent_reply_at.map_or(true, |prev| at > prev) {
            thread.last_agent_reply_at = Some(at);
        }
        thread.unread_count = 0;
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }

    async fn add_tag(&self, workspace_id: Uuid, thread_id: Uuid, tag: &str) -> StoreResult<(Thread, bool)> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        let added = thread.tags.insert(tag.to_string());
        if added {
            thread.updated_at = Utc::now();
        }
        Ok((thread.clone(), added))
    }

    async fn set_status(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        status: ThreadStatus,
    ) -> StoreResult<(Thread, ThreadStatus)> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        let previous = std::mem::replace(&mut thread.status, status);
        thread.updated_at = Utc::now();
        Ok((thread.clone(), previous))
    }

    async fn assign_agent(&self, workspace_id: Uuid, thread_id: Uuid, agent_id: Uuid) -> StoreResult<Thread> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        thread.assigned_agent_id = Some(agent_id);
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }

    async fn set_thread_ai_enabled(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        enabled: bool,
    ) -> StoreResult<Thread> {
        let mut inner = self.inner.write().await;
        let thread = inner.thread_mut(workspace_id, thread_id)?;
        thread.ai_enabled = enabled;
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }

    async fn list_threads_awaiting_response(&self, limit: i64) -> StoreResult<Vec<Thread>> {
        let inner = self.inner.read().await;
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.status == ThreadStatus::Open && t.awaiting_response())
            .cloned()
            .collect();
        threads.sort_by_key(|t| t.last_customer_message_at);
        threads.truncate(limit.max(0) as usize);
        Ok(threads)
    }

    async fn list_open_threads(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Thread>> {
        let inner = self.inner.read().await;
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.workspace_id == workspace_id && t.status == ThreadStatus::Open)
            .cloned()
            .collect();
        threads.sort_by_key(|t| t.created_at);
        threads.truncate(limit.max(0) as usize);
        Ok(threads)
    }

    async fn list_agents(&self, workspace_id: Uuid) -> StoreResult<Vec<Agent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .agents
            .values()
            .filter(|a| a.workspace_id == workspace_id && a.active)
            .map(|a| Agent {
                open_threads: inner.open_threads_for(a.id),
                ..a.clone()
            })
            .collect())
    }

    async fn next_assignment_cursor(&self, workspace_id: Uuid) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let cursor = inner.cursors.entry(workspace_id).or_insert(0);
        let current = *cursor;
        *cursor = cursor.wrapping_add(1);
        Ok(current)
    }

    async fn list_rules(&self, workspace_id: Uuid) -> StoreResult<Vec<AutomationRule>> {
        let inner = self.inner.read().await;
        let mut rules: Vec<AutomationRule> = inner
            .rules
            .values()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(rules)
    }

    async fn list_enabled_rules_for_trigger(&self, trigger: Trigger) -> StoreResult<Vec<AutomationRule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .values()
            .filter(|r| r.enabled && r.trigger == trigger)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<AutomationRule> {
        self.inner
            .read()
            .await
            .rules
            .get(&rule_id)
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("automation rule {rule_id}")))
    }

    async fn insert_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.rules.contains_key(&rule.id) {
            return Err(StoreError::Conflict(format!("automation rule {} exists", rule.id)));
        }
        inner.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.rules.get_mut(&rule.id) {
            Some(existing) if existing.workspace_id == rule.workspace_id => {
                *existing = rule.clone();
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("automation rule {}", rule.id))),
        }
    }

    async fn delete_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.rules.get(&rule_id) {
            Some(rule) if rule.workspace_id == workspace_id => {
                inner.rules.remove(&rule_id);
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("automation rule {rule_id}"))),
        }
    }

    async fn record_rule_firing_if_absent(
        &self,
        rule_id: Uuid,
        thread_id: Uuid,
        anchor: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self
            .inner
            .write()
            .await
            .firings
            .insert((rule_id, thread_id, anchor)))
    }

    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> StoreResult<()> {
        self.inner.write().await.actions.insert(
            action.id,
            LeasedAction {
                action: action.clone(),
                locked_until: None,
            },
        );
        Ok(())
    }

    async fn get_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        self.inner
            .read()
            .await
            .actions
            .get(&id)
            .map(|leased| &leased.action)
            .filter(|a| a.workspace_id == workspace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("scheduled action {id}")))
    }

    async fn list_scheduled_actions(
        &self,
        workspace_id: Uuid,
        status: Option<ScheduledActionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScheduledAction>> {
        let inner = self.inner.read().await;
        let mut actions: Vec<ScheduledAction> = inner
            .actions
            .values()
            .map(|leased| &leased.action)
            .filter(|a| a.workspace_id == workspace_id)
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.run_at);
        Ok(actions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn cancel_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        let mut inner = self.inner.write().await;
        let leased = inner
            .actions
            .get_mut(&id)
            .filter(|l| l.action.workspace_id == workspace_id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled action {id}")))?;

        if leased.action.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "scheduled action {id} is already {}",
                leased.action.status
            )));
        }
        leased.action.status = ScheduledActionStatus::Cancelled;
        leased.action.updated_at = Utc::now();
        Ok(leased.action.clone())
    }

    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<ScheduledAction>> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<&mut LeasedAction> = inner
            .actions
            .values_mut()
            .filter(|l| l.action.status == ScheduledActionStatus::Pending)
            .filter(|l| l.action.run_at <= now)
            .filter(|l| l.locked_until.map_or(true, |until| until <= now))
            .collect();
        due.sort_by_key(|l| l.action.run_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|l| {
                l.locked_until = Some(now + lease);
                l.action.clone()
            })
            .collect())
    }

    async fn mark_action_executed(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(leased) = inner.actions.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("scheduled action {id}")));
        };
        if leased.action.status != ScheduledActionStatus::Pending {
            return Ok(false);
        }
        leased.action.status = ScheduledActionStatus::Executed;
        leased.action.updated_at = Utc::now();
        leased.locked_until = None;
        Ok(true)
    }

    async fn mark_action_retry(
        &self,
        id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let leased = inner
            .actions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled action {id}")))?;
        if leased.action.status == ScheduledActionStatus::Pending {
            leased.action.attempt = attempt;
            leased.action.run_at = run_at;
            leased.action.last_error = Some(error.to_string());
            leased.action.updated_at = Utc::now();
            leased.locked_until = None;
        }
        Ok(())
    }

    async fn mark_action_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let leased = inner
            .actions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled action {id}")))?;
        if leased.action.status == ScheduledActionStatus::Pending {
            leased.action.status = ScheduledActionStatus::Failed;
            leased.action.attempt = attempt;
            leased.action.last_error = Some(error.to_string());
            leased.action.updated_at = Utc::now();
            leased.locked_until = None;
        }
        Ok(())
    }

    async fn get_ai_settings(&self, workspace_id: Uuid) -> StoreResult<AIReplySettings> {
        Ok(self
            .inner
            .read()
            .await
            .ai_settings
            .get(&workspace_id)
            .cloned()
            .unwrap_or_else(|| AIReplySettings::disabled(workspace_id)))
    }

    async fn upsert_ai_settings(&self, settings: &AIReplySettings) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .ai_settings
            .insert(settings.workspace_id, settings.clone());
        Ok(())
    }

    async fn get_thread_ai_state(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<ThreadAIState> {
        Ok(self
            .inner
            .read()
            .await
            .ai_state
            .get(&thread_id)
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .unwrap_or_else(|| ThreadAIState::initial(workspace_id, thread_id)))
    }

    async fn set_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        state: HandoffState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ThreadAIState> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .ai_state
            .entry(thread_id)
            .or_insert_with(|| ThreadAIState::initial(workspace_id, thread_id));
        entry.handoff = state;
        entry.handoff_reason = reason.map(str::to_string);
        entry.handoff_at = state.is_active().then_some(at);
        Ok(entry.clone())
    }

    async fn record_ai_reply(&self, workspace_id: Uuid, thread_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .ai_state
            .entry(thread_id)
            .or_insert_with(|| ThreadAIState::initial(workspace_id, thread_id));
        entry.last_ai_reply_at = Some(at);
        entry.ai_reply_count += 1;
        Ok(())
    }

    async fn append_ai_log(&self, log: &AIReplyLog) -> StoreResult<()> {
        self.inner.write().await.ai_logs.push(log.clone());
        Ok(())
    }

    async fn list_ai_logs(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AIReplyLog>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ai_logs
            .iter()
            .rev()
            .filter(|l| l.workspace_id == workspace_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn accumulate_usage(&self, workspace_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let bucket = inner
            .usage
            .entry((workspace_id, day, delta.provider.clone()))
            .or_insert_with(|| ProviderUsage {
                provider: delta.provider.clone(),
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                calls: 0,
            });
        bucket.tokens_in += delta.tokens_in;
        bucket.tokens_out += delta.tokens_out;
        bucket.cost_usd += delta.cost_usd;
        bucket.calls += 1;
        Ok(())
    }

    async fn usage_between(&self, workspace_id: Uuid, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<UsageRecord>> {
        let inner = self.inner.read().await;
        let mut by_day: BTreeMap<NaiveDate, Vec<ProviderUsage>> = BTreeMap::new();
        for ((ws, day, _), usage) in inner.usage.iter() {
            if *ws == workspace_id && *day >= from && *day <= to {
                by_day.entry(*day).or_default().push(usage.clone());
            }
        }
        Ok(by_day
            .into_iter()
            .map(|(day, providers)| UsageRecord::from_providers(workspace_id, day, providers))
            .collect())
    }

    async fn tokens_since(&self, workspace_id: Uuid, from: NaiveDate) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .usage
            .iter()
            .filter(|((ws, day, _), _)| *ws == workspace_id && *day >= from)
            .map(|(_, u)| u.tokens_in + u.tokens_out)
            .sum())
    }

    async fn append_audit(&self, log: &AuditLog) -> StoreResult<()> {
        self.inner.write().await.audit.push(log.clone());
        Ok(())
    }

    async fn list_audit(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AuditLog>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|l| l.workspace_id == workspace_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_escalation_if_absent(&self, escalation: &Escalation) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.escalation_keys.insert(escalation.key()) {
            return Ok(false);
        }
        inner.escalations.push(escalation.clone());
        Ok(true)
    }

    async fn list_escalations(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Escalation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .escalations
            .iter()
            .rev()
            .filter(|e| e.workspace_id == workspace_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
