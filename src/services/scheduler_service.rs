//! Background runner for scheduled actions, inbound event retries, SLA
//! escalation and `time_elapsed` rules.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{ActionError, StoreResult},
    models::{Actor, AuditAction, CreateAuditLog, ResourceType, ScheduledAction},
    services::{
        audit_service::AuditService,
        automation_service::AutomationEngine,
        backoff_service::{next_backoff_ms, BackoffPolicy},
        pipeline_service::{PipelineWorker, EVENT_LEASE_MINUTES},
        sla_service::SlaService,
    },
    store::Store,
};

/// How long a claimed action stays invisible to other runners
const CLAIM_LEASE_MINUTES: i64 = 5;
const SWEEP_LIMIT: i64 = 500;

/// Counters for one scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub executed: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub events_retried: usize,
    pub escalations: usize,
    pub time_elapsed_fired: usize,
}

/// What to do with an action after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { attempt: i32, run_at: DateTime<Utc> },
    GiveUp { attempt: i32 },
}

/// `attempt` is the number of attempts made before this failure
pub fn retry_decision(
    attempt: i32,
    max_attempts: i32,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
) -> RetryDecision {
    let attempt = attempt.saturating_add(1);
    if attempt >= max_attempts {
        return RetryDecision::GiveUp { attempt };
    }
    let delay_ms = next_backoff_ms(attempt as i64, policy).min(i64::MAX as u64) as i64;
    RetryDecision::Retry {
        attempt,
        run_at: now + Duration::milliseconds(delay_ms),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    engine: AutomationEngine,
    sla: SlaService,
    audit: AuditService,
    worker: PipelineWorker,
    policy: BackoffPolicy,
    max_attempts: i32,
    batch_size: i64,
    poll_interval: StdDuration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        engine: AutomationEngine,
        sla: SlaService,
        audit: AuditService,
        worker: PipelineWorker,
        config: &Config,
    ) -> Self {
        Self {
            store,
            engine,
            sla,
            audit,
            worker,
            policy: config.backoff_policy(),
            max_attempts: config.scheduler_max_attempts.max(1),
            batch_size: config.scheduler_batch_size.max(1),
            poll_interval: StdDuration::from_secs(config.scheduler_poll_interval_secs.max(1)),
        }
    }

    /// Tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(poll_secs = self.poll_interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report != TickReport::default() {
                        tracing::info!(?report, "Scheduler tick");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over due actions, deferred events, SLA breaches and
    /// `time_elapsed` rules. Each stage is isolated from failures in the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.run_due_actions(now, &mut report).await {
            tracing::error!(error = %e, "Failed to process due scheduled actions");
        }

        match self.retry_due_events(now).await {
            Ok(n) => report.events_retried = n,
            Err(e) => tracing::error!(error = %e, "Failed to claim deferred inbound events"),
        }

        match self.escalate_breaches(now).await {
            Ok(n) => report.escalations = n,
            Err(e) => tracing::error!(error = %e, "SLA breach sweep failed"),
        }

        match self.engine.run_time_elapsed_sweep(now, SWEEP_LIMIT).await {
            Ok(n) => report.time_elapsed_fired = n,
            Err(e) => tracing::error!(error = %e, "time_elapsed sweep failed"),
        }

        report
    }

    async fn run_due_actions(&self, now: DateTime<Utc>, report: &mut TickReport) -> StoreResult<()> {
        let due = self
            .store
            .claim_due_actions(now, self.batch_size, Duration::minutes(CLAIM_LEASE_MINUTES))
            .await?;

        for action in due {
            match self.execute(&action).await {
                Ok(()) => match self.store.mark_action_executed(action.id).await {
                    Ok(true) => {
                        report.executed += 1;
                        self.audit
                            .record(CreateAuditLog {
                                workspace_id: action.workspace_id,
                                actor: action_actor(&action),
                                action: AuditAction::ScheduledActionExecuted,
                                resource_type: ResourceType::ScheduledAction,
                                resource_id: Some(action.id.to_string()),
                                details: Some(json!({ "action": action.action_type })),
                            })
                            .await;
                    }
                    Ok(false) => {
                        tracing::info!(
                            scheduled_action_id = %action.id,
                            "Scheduled action left pending while running, not marking executed"
                        );
                        report.skipped += 1;
                    }
                    // The lease expires and the action runs again
                    Err(e) => tracing::error!(
                        scheduled_action_id = %action.id,
                        error = %e,
                        "Failed to mark scheduled action executed"
                    ),
                },
                Err(e) => {
                    if let Err(store_err) = self.handle_failure(&action, &e, now, report).await {
                        tracing::error!(
                            scheduled_action_id = %action.id,
                            error = %store_err,
                            "Failed to record scheduled action failure"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Re-run inbound events whose retry is due or whose claim was abandoned.
    /// Returns how many completed.
    async fn retry_due_events(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let due = self
            .store
            .claim_due_events(now, self.batch_size, Duration::minutes(EVENT_LEASE_MINUTES))
            .await?;

        let mut completed = 0;
        for (event, attempt) in due {
            match self.worker.process_claimed(&event, attempt).await {
                Ok(_) => completed += 1,
                Err(e) => tracing::warn!(
                    workspace_id = %event.workspace_id,
                    external_message_id = %event.external_message_id,
                    attempt,
                    error = %e,
                    "Inbound event retry failed"
                ),
            }
        }
        Ok(completed)
    }

    async fn execute(&self, action: &ScheduledAction) -> Result<(), ActionError> {
        // Cancelled between claim and execution
        let current = self
            .store
            .get_scheduled_action(action.workspace_id, action.id)
            .await?;
        if current.status.is_terminal() {
            return Ok(());
        }

        let thread_id = action.thread_id.ok_or_else(|| ActionError::Failed {
            action: action.action_type.clone(),
            reason: "scheduled action has no thread".to_string(),
        })?;
        let thread = self.store.get_thread(action.workspace_id, thread_id).await?;

        tracing::debug!(
            workspace_id = %action.workspace_id,
            thread_id = %thread_id,
            scheduled_action_id = %action.id,
            action = %action.action_type,
            "Executing scheduled action"
        );
        self.engine.apply_now(&thread, &action.payload, None).await
    }

    async fn handle_failure(
        &self,
        action: &ScheduledAction,
        error: &ActionError,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> StoreResult<()> {
        let message = error.to_string();
        // A missing thread will never appear; retrying only delays the failure
        let permanent = action.thread_id.is_none();
        let decision = if permanent {
            RetryDecision::GiveUp {
                attempt: action.attempt.saturating_add(1),
            }
        } else {
            retry_decision(action.attempt, self.max_attempts, &self.policy, now)
        };

        match decision {
            RetryDecision::Retry { attempt, run_at } => {
                tracing::warn!(
                    scheduled_action_id = %action.id,
                    attempt,
                    %run_at,
                    error = %message,
                    "Scheduled action failed, retrying"
                );
                self.store.mark_action_retry(action.id, attempt, run_at, &message).await?;
                report.retried += 1;
            }
            RetryDecision::GiveUp { attempt } => {
                tracing::error!(
                    scheduled_action_id = %action.id,
                    attempt,
                    error = %message,
                    "Scheduled action failed permanently"
                );
                self.store.mark_action_failed(action.id, attempt, &message).await?;
                self.audit
                    .record(CreateAuditLog {
                        workspace_id: action.workspace_id,
                        actor: action_actor(action),
                        action: AuditAction::ScheduledActionFailed,
                        resource_type: ResourceType::ScheduledAction,
                        resource_id: Some(action.id.to_string()),
                        details: Some(json!({
                            "action": action.action_type,
                            "attempt": attempt,
                            "error": message,
                        })),
                    })
                    .await;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Persist an escalation for every newly breached thread
    pub async fn escalate_breaches(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let threads = self.store.list_threads_awaiting_response(SWEEP_LIMIT).await?;
        let mut created = 0;

        for escalation in self.sla.detect_breaches(&threads, now) {
            if !self.store.record_escalation_if_absent(&escalation).await? {
                continue;
            }
            created += 1;
            tracing::warn!(
                workspace_id = %escalation.workspace_id,
                thread_id = %escalation.thread_id,
                breach_type = %escalation.breach_type,
                due_at = %escalation.due_at,
                "SLA breached"
            );
            self.audit
                .record(CreateAuditLog {
                    workspace_id: escalation.workspace_id,
                    actor: Actor::System,
                    action: AuditAction::SlaEscalated,
                    resource_type: ResourceType::Thread,
                    resource_id: Some(escalation.thread_id.to_string()),
                    details: Some(json!({
                        "breach_type": escalation.breach_type,
                        "due_at": escalation.due_at,
                    })),
                })
                .await;
        }

        Ok(created)
    }
}

fn action_actor(action: &ScheduledAction) -> Actor {
    action.rule_id.map_or(Actor::System, Actor::Rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_minutes: 1.0,
            max_minutes: 60.0,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_first_failure_retries_after_base_delay() {
        match retry_decision(0, 5, &policy(), now()) {
            RetryDecision::Retry { attempt, run_at } => {
                assert_eq!(attempt, 1);
                assert_eq!(run_at, now() + Duration::minutes(1));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        match retry_decision(2, 5, &policy(), now()) {
            RetryDecision::Retry { attempt, run_at } => {
                assert_eq!(attempt, 3);
                assert_eq!(run_at, now() + Duration::minutes(4));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        assert_eq!(
            retry_decision(4, 5, &policy(), now()),
            RetryDecision::GiveUp { attempt: 5 }
        );
    }
}
