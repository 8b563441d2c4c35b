use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::Store;
use crate::{
    error::{StoreError, StoreResult},
    models::{
        AIReplyLog, AIReplySettings, Agent, AuditLog, AutomationRule, Escalation, HandoffState,
        InboundEvent, ProviderUsage, ScheduledAction, ScheduledActionStatus, Thread, ThreadAIState,
        ThreadKey, ThreadStatus, Trigger, UsageDelta, UsageRecord,
    },
};

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

fn parse_enum<T>(value: &str, column: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| StoreError::Corrupt(format!("{column}: {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(value: Value, column: &str) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, column: &str) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

#[derive(Debug, FromRow)]
struct ThreadRow {
    id: Uuid,
    workspace_id: Uuid,
    channel: String,
    external_id: String,
    account_id: String,
    contact_name: Option<String>,
    last_customer_message_at: Option<DateTime<Utc>>,
    last_agent_reply_at: Option<DateTime<Utc>>,
    first_response_at: Option<DateTime<Utc>>,
    last_message_text: Option<String>,
    ai_enabled: bool,
    unread_count: i32,
    tags: Vec<String>,
    priority: String,
    status: String,
    assigned_agent_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ThreadRow> for Thread {
    type Error = StoreError;

    fn try_from(row: ThreadRow) -> StoreResult<Self> {
        Ok(Thread {
            id: row.id,
            workspace_id: row.workspace_id,
            channel: parse_enum(&row.channel, "threads.channel")?,
            external_id: row.external_id,
            account_id: row.account_id,
            contact_name: row.contact_name,
            last_customer_message_at: row.last_customer_message_at,
            last_agent_reply_at: row.last_agent_reply_at,
            first_response_at: row.first_response_at,
            last_message_text: row.last_message_text,
            ai_enabled: row.ai_enabled,
            unread_count: row.unread_count,
            tags: row.tags.into_iter().collect(),
            priority: parse_enum(&row.priority, "threads.priority")?,
            status: parse_enum(&row.status, "threads.status")?,
            assigned_agent_id: row.assigned_agent_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    trigger: String,
    conditions: Value,
    actions: Value,
    enabled: bool,
    priority: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for AutomationRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> StoreResult<Self> {
        Ok(AutomationRule {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            trigger: parse_enum(&row.trigger, "automation_rules.trigger")?,
            conditions: parse_json(row.conditions, "automation_rules.conditions")?,
            actions: parse_json(row.actions, "automation_rules.actions")?,
            enabled: row.enabled,
            priority: row.priority,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScheduledActionRow {
    id: Uuid,
    workspace_id: Uuid,
    thread_id: Option<Uuid>,
    rule_id: Option<Uuid>,
    run_at: DateTime<Utc>,
    action_type: String,
    payload: Value,
    status: String,
    attempt: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduledActionRow> for ScheduledAction {
    type Error = StoreError;

    fn try_from(row: ScheduledActionRow) -> StoreResult<Self> {
        Ok(ScheduledAction {
            id: row.id,
            workspace_id: row.workspace_id,
            thread_id: row.thread_id,
            rule_id: row.rule_id,
            run_at: row.run_at,
            action_type: row.action_type,
            payload: parse_json(row.payload, "scheduled_actions.payload")?,
            status: parse_enum(&row.status, "scheduled_actions.status")?,
            attempt: row.attempt,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SettingsRow {
    workspace_id: Uuid,
    allow_automation: bool,
    provider: String,
    model: String,
    system_prompt: String,
    max_output_tokens: i32,
    temperature: f32,
    monthly_token_cap: Option<i64>,
    sandbox_enabled: bool,
    sandbox_whitelist: Vec<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SettingsRow> for AIReplySettings {
    type Error = StoreError;

    fn try_from(row: SettingsRow) -> StoreResult<Self> {
        Ok(AIReplySettings {
            workspace_id: row.workspace_id,
            allow_automation: row.allow_automation,
            provider: parse_enum(&row.provider, "ai_reply_settings.provider")?,
            model: row.model,
            system_prompt: row.system_prompt,
            max_output_tokens: row.max_output_tokens.max(0) as u32,
            temperature: row.temperature,
            monthly_token_cap: row.monthly_token_cap,
            sandbox_enabled: row.sandbox_enabled,
            sandbox_whitelist: row.sandbox_whitelist,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AIStateRow {
    thread_id: Uuid,
    workspace_id: Uuid,
    handoff: String,
    handoff_reason: Option<String>,
    handoff_at: Option<DateTime<Utc>>,
    last_ai_reply_at: Option<DateTime<Utc>>,
    ai_reply_count: i64,
}

impl TryFrom<AIStateRow> for ThreadAIState {
    type Error = StoreError;

    fn try_from(row: AIStateRow) -> StoreResult<Self> {
        Ok(ThreadAIState {
            thread_id: row.thread_id,
            workspace_id: row.workspace_id,
            handoff: parse_enum(&row.handoff, "thread_ai_state.handoff")?,
            handoff_reason: row.handoff_reason,
            handoff_at: row.handoff_at,
            last_ai_reply_at: row.last_ai_reply_at,
            ai_reply_count: row.ai_reply_count,
        })
    }
}

#[derive(Debug, FromRow)]
struct AgentRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    active: bool,
    open_threads: i64,
}

#[derive(Debug, FromRow)]
struct AILogRow {
    id: Uuid,
    workspace_id: Uuid,
    thread_id: Uuid,
    external_message_id: String,
    replied: bool,
    reason: String,
    provider: Option<String>,
    model: Option<String>,
    tokens_in: i64,
    tokens_out: i64,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct UsageRow {
    day: NaiveDate,
    provider: String,
    tokens_in: i64,
    tokens_out: i64,
    cost_usd: f64,
    calls: i64,
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    workspace_id: Uuid,
    actor: String,
    action: String,
    resource_type: String,
    resource_id: Option<String>,
    details: Option<Value>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct EscalationRow {
    id: Uuid,
    workspace_id: Uuid,
    thread_id: Uuid,
    breach_type: String,
    due_at: DateTime<Utc>,
    detected_at: DateTime<Utc>,
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    async fn workspace_for_account(&self, account_id: &str) -> StoreResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT workspace_id FROM channel_accounts WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn claim_event(&self, event: &InboundEvent, lease: Duration) -> StoreResult<Option<i32>> {
        // A conflicting row is only re-claimed when unprocessed and not leased
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO inbound_events
                (workspace_id, external_message_id, provider, thread_key, account_id,
                 sender_id, event_type, occurred_at, raw_payload, event, locked_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (workspace_id, external_message_id) DO UPDATE
                SET locked_until = EXCLUDED.locked_until
                WHERE inbound_events.processed_at IS NULL
                  AND inbound_events.locked_until <= NOW()
            RETURNING attempts
            "#,
        )
        .bind(event.workspace_id)
        .bind(&event.external_message_id)
        .bind(event.provider.to_string())
        .bind(&event.thread_id)
        .bind(&event.account_id)
        .bind(&event.sender_id)
        .bind(event.event_type.to_string())
        .bind(event.timestamp)
        .bind(&event.raw_payload)
        .bind(to_json(event, "event")?)
        .bind(Utc::now() + lease)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(attempts,)| attempts + 1))
    }

    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<(InboundEvent, i32)>> {
        let rows: Vec<(Value, i32)> = sqlx::query_as(
            r#"
            UPDATE inbound_events SET locked_until = $3
            WHERE (workspace_id, external_message_id) IN (
                SELECT workspace_id, external_message_id FROM inbound_events
                WHERE processed_at IS NULL
                  AND locked_until <= $1
                  AND COALESCE(retry_at, locked_until) <= $1
                ORDER BY COALESCE(retry_at, locked_until) ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING event, attempts
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(now + lease)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(event, attempts)| Ok((parse_json(event, "event")?, attempts + 1)))
            .collect()
    }

    async fn mark_event_processed(&self, workspace_id: Uuid, external_message_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events SET processed_at = NOW(), retry_at = NULL
            WHERE workspace_id = $1 AND external_message_id = $2
            "#,
        )
        .bind(workspace_id)
        .bind(external_message_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {external_message_id}")));
        }
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
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET attempts = $3, retry_at = $4, last_error = $5, locked_until = NOW()
            WHERE workspace_id = $1 AND external_message_id = $2 AND processed_at IS NULL
            "#,
        )
        .bind(workspace_id)
        .bind(external_message_id)
        .bind(attempt)
        .bind(retry_at)
        .bind(error)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {external_message_id}")));
        }
        Ok(())
    }

    async fn fail_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        error: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET attempts = $3, last_error = $4, retry_at = NULL, processed_at = NOW()
            WHERE workspace_id = $1 AND external_message_id = $2
            "#,
        )
        .bind(workspace_id)
        .bind(external_message_id)
        .bind(attempt)
        .bind(error)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {external_message_id}")));
        }
        Ok(())
    }

    async fn get_or_create_thread(&self, key: &ThreadKey) -> StoreResult<Thread> {
        let row = sqlx::query_as::<_, ThreadRow>(
            r#"
            INSERT INTO threads (id, workspace_id, channel, external_id, account_id, contact_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workspace_id, channel, external_id)
            DO UPDATE SET contact_name = COALESCE(threads.contact_name, EXCLUDED.contact_name)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.workspace_id)
        .bind(key.channel.to_string())
        .bind(&key.external_id)
        .bind(&key.account_id)
        .bind(&key.contact_name)
        .fetch_one(&self.db)
        .await?;

        row.try_into()
    }

    async fn get_thread(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<Thread> {
        sqlx::query_as::<_, ThreadRow>("SELECT * FROM threads WHERE id = $1 AND workspace_id = $2")
            .bind(thread_id)
            .bind(workspace_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))?
            .try_into()
    }

    async fn record_customer_message(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
        text: Option<&str>,
    ) -> StoreResult<Thread> {
        sqlx::query_as::<_, ThreadRow>(
            r#"
            UPDATE threads SET
                last_message_text = CASE
                    WHEN last_customer_message_at IS NULL OR $3 > last_customer_message_at
                    THEN COALESCE($4, last_message_text)
                    ELSE last_message_text END,
                last_customer_message_at = GREATEST(COALESCE(last_customer_message_at, $3), $3),
                unread_count = unread_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(at)
        .bind(text)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))?
        .try_into()
    }

    async fn set_first_response_at_if_null(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            UPDATE threads SET first_response_at = COALESCE(first_response_at, $3)
            WHERE id = $1 AND workspace_id = $2
            RETURNING first_response_at
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?;

        row.map(|(stored,)| stored)
            .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))
    }

    async fn record_agent_reply(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Thread> {
        sqlx::query_as::<_, ThreadRow>(
            r#"
            UPDATE threads SET
                last_agent_reply_at = GREATEST(COALESCE(last_agent_reply_at, $3), $3),
                unread_count = 0,
                updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))?
        .try_into()
    }

    async fn add_tag(&self, workspace_id: Uuid, thread_id: Uuid, tag: &str) -> StoreResult<(Thread, bool)> {
        let updated = sqlx::query_as::<_, ThreadRow>(
            r#"
            UPDATE threads SET tags = array_append(tags, $3), updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2 AND NOT ($3 = ANY(tags))
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(tag)
        .fetch_optional(&self.db)
        .await?;

        match updated {
            Some(row) => Ok((row.try_into()?, true)),
            None => Ok((self.get_thread(workspace_id, thread_id).await?, false)),
        }
    }

    async fn set_status(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        status: ThreadStatus,
    ) -> StoreResult<(Thread, ThreadStatus)> {
        let mut tx = self.db.begin().await?;

        let previous: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM threads WHERE id = $1 AND workspace_id = $2 FOR UPDATE",
        )
        .bind(thread_id)
        .bind(workspace_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((previous,)) = previous else {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        };

        let row = sqlx::query_as::<_, ThreadRow>(
            "UPDATE threads SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(thread_id)
        .bind(status.to_string())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((row.try_into()?, parse_enum(&previous, "threads.status")?))
    }

    async fn assign_agent(&self, workspace_id: Uuid, thread_id: Uuid, agent_id: Uuid) -> StoreResult<Thread> {
        sqlx::query_as::<_, ThreadRow>(
            r#"
            UPDATE threads SET assigned_agent_id = $3, updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(agent_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))?
        .try_into()
    }

    async fn set_thread_ai_enabled(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        enabled: bool,
    ) -> StoreResult<Thread> {
        sqlx::query_as::<_, ThreadRow>(
            r#"
            UPDATE threads SET ai_enabled = $3, updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(enabled)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))?
        .try_into()
    }

    async fn list_threads_awaiting_response(&self, limit: i64) -> StoreResult<Vec<Thread>> {
        let rows = sqlx::query_as::<_, ThreadRow>(
            r#"
            SELECT * FROM threads
            WHERE status = 'open'
              AND last_customer_message_at IS NOT NULL
              AND (last_agent_reply_at IS NULL OR last_agent_reply_at < last_customer_message_at)
            ORDER BY last_customer_message_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        collect(rows)
    }

    async fn list_open_threads(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Thread>> {
        let rows = sqlx::query_as::<_, ThreadRow>(
            r#"
            SELECT * FROM threads
            WHERE workspace_id = $1 AND status = 'open'
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        collect(rows)
    }

    async fn list_agents(&self, workspace_id: Uuid) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT a.id, a.workspace_id, a.name, a.active,
                   COUNT(t.id) FILTER (WHERE t.status = 'open') AS open_threads
            FROM agents a
            LEFT JOIN threads t ON t.assigned_agent_id = a.id
            WHERE a.workspace_id = $1 AND a.active
            GROUP BY a.id
            ORDER BY a.id
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Agent {
                id: r.id,
                workspace_id: r.workspace_id,
                name: r.name,
                active: r.active,
                open_threads: r.open_threads,
            })
            .collect())
    }

    async fn next_assignment_cursor(&self, workspace_id: Uuid) -> StoreResult<u64> {
        let (position,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO assignment_cursors (workspace_id, position) VALUES ($1, 1)
            ON CONFLICT (workspace_id) DO UPDATE SET position = assignment_cursors.position + 1
            RETURNING position - 1
            "#,
        )
        .bind(workspace_id)
        .fetch_one(&self.db)
        .await?;

        Ok(position.max(0) as u64)
    }

    async fn list_rules(&self, workspace_id: Uuid) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM automation_rules WHERE workspace_id = $1 ORDER BY priority DESC, created_at ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.db)
        .await?;

        collect(rows)
    }

    async fn list_enabled_rules_for_trigger(&self, trigger: Trigger) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM automation_rules WHERE trigger = $1 AND enabled ORDER BY workspace_id",
        )
        .bind(trigger.to_string())
        .fetch_all(&self.db)
        .await?;

        collect(rows)
    }

    async fn get_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<AutomationRule> {
        sqlx::query_as::<_, RuleRow>("SELECT * FROM automation_rules WHERE id = $1 AND workspace_id = $2")
            .bind(rule_id)
            .bind(workspace_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("automation rule {rule_id}")))?
            .try_into()
    }

    async fn insert_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules
                (id, workspace_id, name, trigger, conditions, actions, enabled, priority, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.id)
        .bind(rule.workspace_id)
        .bind(&rule.name)
        .bind(rule.trigger.to_string())
        .bind(to_json(&rule.conditions, "automation_rules.conditions")?)
        .bind(to_json(&rule.actions, "automation_rules.actions")?)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules SET
                name = $3, trigger = $4, conditions = $5, actions = $6,
                enabled = $7, priority = $8, updated_at = $9
            WHERE id = $1 AND workspace_id = $2
            "#,
        )
        .bind(rule.id)
        .bind(rule.workspace_id)
        .bind(&rule.name)
        .bind(rule.trigger.to_string())
        .bind(to_json(&rule.conditions, "automation_rules.conditions")?)
        .bind(to_json(&rule.actions, "automation_rules.actions")?)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(rule.updated_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("automation rule {}", rule.id)));
        }
        Ok(())
    }

    async fn delete_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = $1 AND workspace_id = $2")
            .bind(rule_id)
            .bind(workspace_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("automation rule {rule_id}")));
        }
        Ok(())
    }

    async fn record_rule_firing_if_absent(
        &self,
        rule_id: Uuid,
        thread_id: Uuid,
        anchor: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rule_firings (rule_id, thread_id, anchor) VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(rule_id)
        .bind(thread_id)
        .bind(anchor)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_actions
                (id, workspace_id, thread_id, rule_id, run_at, action_type, payload,
                 status, attempt, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(action.id)
        .bind(action.workspace_id)
        .bind(action.thread_id)
        .bind(action.rule_id)
        .bind(action.run_at)
        .bind(&action.action_type)
        .bind(to_json(&action.payload, "scheduled_actions.payload")?)
        .bind(action.status.to_string())
        .bind(action.attempt)
        .bind(&action.last_error)
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        sqlx::query_as::<_, ScheduledActionRow>(
            r#"
            SELECT id, workspace_id, thread_id, rule_id, run_at, action_type, payload,
                   status, attempt, last_error, created_at, updated_at
            FROM scheduled_actions WHERE id = $1 AND workspace_id = $2
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("scheduled action {id}")))?
        .try_into()
    }

    async fn list_scheduled_actions(
        &self,
        workspace_id: Uuid,
        status: Option<ScheduledActionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScheduledAction>> {
        let rows = sqlx::query_as::<_, ScheduledActionRow>(
            r#"
            SELECT id, workspace_id, thread_id, rule_id, run_at, action_type, payload,
                   status, attempt, last_error, created_at, updated_at
            FROM scheduled_actions
            WHERE workspace_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY run_at ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(workspace_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        collect(rows)
    }

    async fn cancel_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction> {
        let updated = sqlx::query_as::<_, ScheduledActionRow>(
            r#"
            UPDATE scheduled_actions SET status = 'cancelled', locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND workspace_id = $2 AND status = 'pending'
            RETURNING id, workspace_id, thread_id, rule_id, run_at, action_type, payload,
                      status, attempt, last_error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.db)
        .await?;

        match updated {
            Some(row) => row.try_into(),
            None => {
                let existing = self.get_scheduled_action(workspace_id, id).await?;
                Err(StoreError::Conflict(format!(
                    "scheduled action {id} is already {}",
                    existing.status
                )))
            }
        }
    }

    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<ScheduledAction>> {
        let rows = sqlx::query_as::<_, ScheduledActionRow>(
            r#"
            UPDATE scheduled_actions SET locked_until = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM scheduled_actions
                WHERE status = 'pending'
                  AND run_at <= $1
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, workspace_id, thread_id, rule_id, run_at, action_type, payload,
                      status, attempt, last_error, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(now + lease)
        .fetch_all(&self.db)
        .await?;

        let mut actions: Vec<ScheduledAction> = collect(rows)?;
        actions.sort_by_key(|a| a.run_at);
        Ok(actions)
    }

    async fn mark_action_executed(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions SET status = 'executed', locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_action_retry(
        &self,
        id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET attempt = $2, run_at = $3, last_error = $4, locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(run_at)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_action_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'failed', attempt = $2, last_error = $3, locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_ai_settings(&self, workspace_id: Uuid) -> StoreResult<AIReplySettings> {
        let row = sqlx::query_as::<_, SettingsRow>("SELECT * FROM ai_reply_settings WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Ok(AIReplySettings::disabled(workspace_id)),
        }
    }

    async fn upsert_ai_settings(&self, settings: &AIReplySettings) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_reply_settings
                (workspace_id, allow_automation, provider, model, system_prompt, max_output_tokens,
                 temperature, monthly_token_cap, sandbox_enabled, sandbox_whitelist, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (workspace_id) DO UPDATE SET
                allow_automation = EXCLUDED.allow_automation,
                provider = EXCLUDED.provider,
                model = EXCLUDED.model,
                system_prompt = EXCLUDED.system_prompt,
                max_output_tokens = EXCLUDED.max_output_tokens,
                temperature = EXCLUDED.temperature,
                monthly_token_cap = EXCLUDED.monthly_token_cap,
                sandbox_enabled = EXCLUDED.sandbox_enabled,
                sandbox_whitelist = EXCLUDED.sandbox_whitelist,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(settings.workspace_id)
        .bind(settings.allow_automation)
        .bind(settings.provider.to_string())
        .bind(&settings.model)
        .bind(&settings.system_prompt)
        .bind(settings.max_output_tokens.min(i32::MAX as u32) as i32)
        .bind(settings.temperature)
        .bind(settings.monthly_token_cap)
        .bind(settings.sandbox_enabled)
        .bind(&settings.sandbox_whitelist)
        .bind(settings.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_thread_ai_state(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<ThreadAIState> {
        let row = sqlx::query_as::<_, AIStateRow>(
            "SELECT * FROM thread_ai_state WHERE thread_id = $1 AND workspace_id = $2",
        )
        .bind(thread_id)
        .bind(workspace_id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Ok(ThreadAIState::initial(workspace_id, thread_id)),
        }
    }

    async fn set_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        state: HandoffState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ThreadAIState> {
        let handoff_at = state.is_active().then_some(at);
        sqlx::query_as::<_, AIStateRow>(
            r#"
            INSERT INTO thread_ai_state (thread_id, workspace_id, handoff, handoff_reason, handoff_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (thread_id) DO UPDATE SET
                handoff = EXCLUDED.handoff,
                handoff_reason = EXCLUDED.handoff_reason,
                handoff_at = EXCLUDED.handoff_at
            RETURNING *
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(state.to_string())
        .bind(reason)
        .bind(handoff_at)
        .fetch_one(&self.db)
        .await?
        .try_into()
    }

    async fn record_ai_reply(&self, workspace_id: Uuid, thread_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO thread_ai_state (thread_id, workspace_id, last_ai_reply_at, ai_reply_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (thread_id) DO UPDATE SET
                last_ai_reply_at = EXCLUDED.last_ai_reply_at,
                ai_reply_count = thread_ai_state.ai_reply_count + 1
            "#,
        )
        .bind(thread_id)
        .bind(workspace_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn append_ai_log(&self, log: &AIReplyLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_reply_logs
                (id, workspace_id, thread_id, external_message_id, replied, reason,
                 provider, model, tokens_in, tokens_out, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(log.id)
        .bind(log.workspace_id)
        .bind(log.thread_id)
        .bind(&log.external_message_id)
        .bind(log.replied)
        .bind(&log.reason)
        .bind(&log.provider)
        .bind(&log.model)
        .bind(log.tokens_in)
        .bind(log.tokens_out)
        .bind(&log.error)
        .bind(log.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_ai_logs(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AIReplyLog>> {
        let rows = sqlx::query_as::<_, AILogRow>(
            r#"
            SELECT * FROM ai_reply_logs
            WHERE workspace_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AIReplyLog {
                id: r.id,
                workspace_id: r.workspace_id,
                thread_id: r.thread_id,
                external_message_id: r.external_message_id,
                replied: r.replied,
                reason: r.reason,
                provider: r.provider,
                model: r.model,
                tokens_in: r.tokens_in,
                tokens_out: r.tokens_out,
                error: r.error,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn accumulate_usage(&self, workspace_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_daily (workspace_id, day, provider, tokens_in, tokens_out, cost_usd, calls)
            VALUES ($1, $2, $3, $4, $5, $6, 1)
            ON CONFLICT (workspace_id, day, provider) DO UPDATE SET
                tokens_in = usage_daily.tokens_in + EXCLUDED.tokens_in,
                tokens_out = usage_daily.tokens_out + EXCLUDED.tokens_out,
                cost_usd = usage_daily.cost_usd + EXCLUDED.cost_usd,
                calls = usage_daily.calls + 1
            "#,
        )
        .bind(workspace_id)
        .bind(day)
        .bind(&delta.provider)
        .bind(delta.tokens_in)
        .bind(delta.tokens_out)
        .bind(delta.cost_usd)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn usage_between(&self, workspace_id: Uuid, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<UsageRecord>> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT day, provider, tokens_in, tokens_out, cost_usd, calls
            FROM usage_daily
            WHERE workspace_id = $1 AND day BETWEEN $2 AND $3
            ORDER BY day ASC, provider ASC
            "#,
        )
        .bind(workspace_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        let mut records: Vec<UsageRecord> = Vec::new();
        let mut current: Option<(NaiveDate, Vec<ProviderUsage>)> = None;
        for row in rows {
            let usage = ProviderUsage {
                provider: row.provider,
                tokens_in: row.tokens_in,
                tokens_out: row.tokens_out,
                cost_usd: row.cost_usd,
                calls: row.calls,
            };
            match current.as_mut() {
                Some((day, providers)) if *day == row.day => providers.push(usage),
                _ => {
                    if let Some((day, providers)) = current.take() {
                        records.push(UsageRecord::from_providers(workspace_id, day, providers));
                    }
                    current = Some((row.day, vec![usage]));
                }
            }
        }
        if let Some((day, providers)) = current {
            records.push(UsageRecord::from_providers(workspace_id, day, providers));
        }

        Ok(records)
    }

    async fn tokens_since(&self, workspace_id: Uuid, from: NaiveDate) -> StoreResult<i64> {
        let (total,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(tokens_in + tokens_out)::BIGINT FROM usage_daily
            WHERE workspace_id = $1 AND day >= $2
            "#,
        )
        .bind(workspace_id)
        .bind(from)
        .fetch_one(&self.db)
        .await?;

        Ok(total.unwrap_or(0))
    }

    async fn append_audit(&self, log: &AuditLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, workspace_id, actor, action, resource_type, resource_id, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(log.id)
        .bind(log.workspace_id)
        .bind(&log.actor)
        .bind(&log.action)
        .bind(&log.resource_type)
        .bind(&log.resource_id)
        .bind(&log.details)
        .bind(log.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AuditLog>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT * FROM audit_logs
            WHERE workspace_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AuditLog {
                id: r.id,
                workspace_id: r.workspace_id,
                actor: r.actor,
                action: r.action,
                resource_type: r.resource_type,
                resource_id: r.resource_id,
                details: r.details,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn record_escalation_if_absent(&self, escalation: &Escalation) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO escalations (id, workspace_id, thread_id, breach_type, due_at, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (thread_id, breach_type, due_at) DO NOTHING
            "#,
        )
        .bind(escalation.id)
        .bind(escalation.workspace_id)
        .bind(escalation.thread_id)
        .bind(escalation.breach_type.to_string())
        .bind(escalation.due_at)
        .bind(escalation.detected_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_escalations(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Escalation>> {
        let rows = sqlx::query_as::<_, EscalationRow>(
            r#"
            SELECT * FROM escalations
            WHERE workspace_id = $1
            ORDER BY detected_at DESC
            LIMIT $2
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(Escalation {
                    id: r.id,
                    workspace_id: r.workspace_id,
                    thread_id: r.thread_id,
                    breach_type: parse_enum(&r.breach_type, "escalations.breach_type")?,
                    due_at: r.due_at,
                    detected_at: r.detected_at,
                })
            })
            .collect()
    }
}
