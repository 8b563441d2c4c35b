//! Persistence boundary.
//!
//! Services talk to a `dyn Store`. `PgStore` is the production backend,
//! `MemoryStore` backs tests and local runs without Postgres. Every method
//! that other components race on is a single atomic operation in both
//! backends (conditional writes, upserts, claim-with-lease).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
    error::StoreResult,
    models::{
        AIReplyLog, AIReplySettings, Agent, AuditLog, AutomationRule, Escalation, HandoffState,
        InboundEvent, ScheduledAction, ScheduledActionStatus, Thread, ThreadAIState, ThreadKey,
        ThreadStatus, Trigger, UsageDelta, UsageRecord,
    },
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Connectivity check for the health endpoint
    async fn ping(&self) -> StoreResult<()>;

    // -- workspace directory ------------------------------------------------

    /// Workspace owning a business account (WhatsApp phone number id)
    async fn workspace_for_account(&self, account_id: &str) -> StoreResult<Option<Uuid>>;

    // -- inbound events -----------------------------------------------------

    /// Claim `(workspace_id, external_message_id)` for processing, persisting
    /// the event on first sight. Returns the attempt number of this run, or
    /// `None` when the event was already processed or another claim on it
    /// has not expired.
    async fn claim_event(&self, event: &InboundEvent, lease: Duration) -> StoreResult<Option<i32>>;

    /// Lease up to `limit` unprocessed events that are due for a retry or
    /// whose claim was abandoned, with the attempt number of the new run
    async fn claim_due_events(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<(InboundEvent, i32)>>;

    /// Claimed -> processed. Later deliveries of the event are duplicates.
    async fn mark_event_processed(&self, workspace_id: Uuid, external_message_id: &str) -> StoreResult<()>;

    /// Release the claim after failed run `attempt`; the event becomes due
    /// again at `retry_at`, or earlier if the provider redelivers it
    async fn defer_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    /// Stop retrying an event after failed run `attempt`
    async fn fail_event(
        &self,
        workspace_id: Uuid,
        external_message_id: &str,
        attempt: i32,
        error: &str,
    ) -> StoreResult<()>;

    // -- threads ------------------------------------------------------------

    async fn get_or_create_thread(&self, key: &ThreadKey) -> StoreResult<Thread>;

    async fn get_thread(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<Thread>;

    /// Bump `last_customer_message_at` (never backwards), unread count and
    /// last message text.
    async fn record_customer_message(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
        text: Option<&str>,
    ) -> StoreResult<Thread>;

    /// Set `first_response_at` only if it is still null. Returns the stored value.
    async fn set_first_response_at_if_null(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>>;

    /// Record an outbound agent or AI reply
    async fn record_agent_reply(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Thread>;

    /// Returns the thread and whether the tag was newly added
    async fn add_tag(&self, workspace_id: Uuid, thread_id: Uuid, tag: &str) -> StoreResult<(Thread, bool)>;

    /// Returns the thread and the status it had before the write
    async fn set_status(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        status: ThreadStatus,
    ) -> StoreResult<(Thread, ThreadStatus)>;

    async fn assign_agent(&self, workspace_id: Uuid, thread_id: Uuid, agent_id: Uuid) -> StoreResult<Thread>;

    async fn set_thread_ai_enabled(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        enabled: bool,
    ) -> StoreResult<Thread>;

    /// Open threads whose latest customer message is unanswered, oldest first
    async fn list_threads_awaiting_response(&self, limit: i64) -> StoreResult<Vec<Thread>>;

    async fn list_open_threads(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Thread>>;

    // -- agents -------------------------------------------------------------

    /// Active agents with their open thread counts, ordered by id
    async fn list_agents(&self, workspace_id: Uuid) -> StoreResult<Vec<Agent>>;

    /// Atomically return and advance the workspace round-robin cursor
    async fn next_assignment_cursor(&self, workspace_id: Uuid) -> StoreResult<u64>;

    // -- automation rules ---------------------------------------------------

    async fn list_rules(&self, workspace_id: Uuid) -> StoreResult<Vec<AutomationRule>>;

    /// Enabled rules for a trigger across every workspace
    async fn list_enabled_rules_for_trigger(&self, trigger: Trigger) -> StoreResult<Vec<AutomationRule>>;

    async fn get_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<AutomationRule>;

    async fn insert_rule(&self, rule: &AutomationRule) -> StoreResult<()>;

    async fn update_rule(&self, rule: &AutomationRule) -> StoreResult<()>;

    async fn delete_rule(&self, workspace_id: Uuid, rule_id: Uuid) -> StoreResult<()>;

    /// Record that a rule fired for a thread at `anchor`. Returns `false`
    /// when it already fired for that anchor.
    async fn record_rule_firing_if_absent(
        &self,
        rule_id: Uuid,
        thread_id: Uuid,
        anchor: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // -- scheduled actions --------------------------------------------------

    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> StoreResult<()>;

    async fn get_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction>;

    async fn list_scheduled_actions(
        &self,
        workspace_id: Uuid,
        status: Option<ScheduledActionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScheduledAction>>;

    /// Pending -> cancelled. `Conflict` if the action is already terminal.
    async fn cancel_scheduled_action(&self, workspace_id: Uuid, id: Uuid) -> StoreResult<ScheduledAction>;

    /// Lease up to `limit` pending actions due at `now`. A leased action is
    /// invisible to other claimers until `lease` elapses.
    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> StoreResult<Vec<ScheduledAction>>;

    /// Pending -> executed. Returns `false` if the action left `pending`
    /// (e.g. cancelled) while it was leased.
    async fn mark_action_executed(&self, id: Uuid) -> StoreResult<bool>;

    async fn mark_action_retry(
        &self,
        id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    async fn mark_action_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<()>;

    // -- AI reply -----------------------------------------------------------

    /// Stored settings, or the disabled defaults
    async fn get_ai_settings(&self, workspace_id: Uuid) -> StoreResult<AIReplySettings>;

    async fn upsert_ai_settings(&self, settings: &AIReplySettings) -> StoreResult<()>;

    /// Stored state, or the initial state
    async fn get_thread_ai_state(&self, workspace_id: Uuid, thread_id: Uuid) -> StoreResult<ThreadAIState>;

    async fn set_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        state: HandoffState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ThreadAIState>;

    async fn record_ai_reply(&self, workspace_id: Uuid, thread_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn append_ai_log(&self, log: &AIReplyLog) -> StoreResult<()>;

    async fn list_ai_logs(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AIReplyLog>>;

    // -- usage --------------------------------------------------------------

    /// Add a delta to the `(workspace, day, provider)` bucket
    async fn accumulate_usage(&self, workspace_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> StoreResult<()>;

    /// Daily records in `[from, to]`, ascending
    async fn usage_between(&self, workspace_id: Uuid, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<UsageRecord>>;

    /// Input plus output tokens recorded on or after `from`
    async fn tokens_since(&self, workspace_id: Uuid, from: NaiveDate) -> StoreResult<i64>;

    // -- audit --------------------------------------------------------------

    async fn append_audit(&self, log: &AuditLog) -> StoreResult<()>;

    async fn list_audit(&self, workspace_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<AuditLog>>;

    // -- escalations --------------------------------------------------------

    /// Returns `false` when `(thread_id, breach_type, due_at)` was already recorded
    async fn record_escalation_if_absent(&self, escalation: &Escalation) -> StoreResult<bool>;

    async fn list_escalations(&self, workspace_id: Uuid, limit: i64) -> StoreResult<Vec<Escalation>>;
}
