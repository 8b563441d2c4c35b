//! Second phase of webhook handling.
//!
//! The webhook route verifies, normalizes and enqueues a batch, then
//! acknowledges. `PipelineWorker` drains the queue and does the stateful
//! work for each event in isolation: a failing event is logged and the
//! rest of the batch still runs.
//!
//! An event only counts as seen once its thread update is committed. Until
//! then a failure defers it with backoff and the scheduler picks it up
//! again, since the provider was already acknowledged and will not resend.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, AppResult, StoreResult},
    models::{
        Actor, AuditAction, CreateAuditLog, DeliveryStatus, EventType, InboundEvent, NormalizedBatch,
        ReplyOutcome, ResourceType, RuleEvent, Thread, ThreadKey,
    },
    services::{
        ai_reply_service::AiReplyService,
        audit_service::AuditService,
        automation_service::AutomationEngine,
        backoff_service::BackoffPolicy,
        scheduler_service::{retry_decision, RetryDecision},
        sla_service::SlaService,
    },
    store::Store,
};

/// How long a claimed event stays invisible to redeliveries and retries
pub const EVENT_LEASE_MINUTES: i64 = 5;

/// One acknowledged webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub batch: NormalizedBatch,
    pub received_at: DateTime<Utc>,
}

pub type JobSender = mpsc::Sender<WebhookJob>;
pub type JobReceiver = mpsc::Receiver<WebhookJob>;

pub fn job_channel(capacity: usize) -> (JobSender, JobReceiver) {
    mpsc::channel(capacity.max(1))
}

/// What processing one event amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    Duplicate,
    StatusRecorded,
    Processed {
        thread_id: Uuid,
        rules_executed: usize,
        reply: ReplyOutcome,
    },
}

#[derive(Clone)]
pub struct PipelineWorker {
    store: Arc<dyn Store>,
    sla: SlaService,
    engine: AutomationEngine,
    ai: AiReplyService,
    audit: AuditService,
    policy: BackoffPolicy,
    max_attempts: i32,
}

impl PipelineWorker {
    pub fn new(
        store: Arc<dyn Store>,
        sla: SlaService,
        engine: AutomationEngine,
        ai: AiReplyService,
        audit: AuditService,
        config: &Config,
    ) -> Self {
        Self {
            store,
            sla,
            engine,
            ai,
            audit,
            policy: config.backoff_policy(),
            max_attempts: config.scheduler_max_attempts.max(1),
        }
    }

    /// Drain jobs until every sender is dropped
    pub async fn run(self, mut rx: JobReceiver) {
        tracing::info!("Webhook pipeline worker started");
        while let Some(job) = rx.recv().await {
            self.process_batch(job).await;
        }
        tracing::info!("Webhook pipeline worker stopped");
    }

    pub async fn process_batch(&self, job: WebhookJob) -> Vec<AppResult<EventDisposition>> {
        let lag_ms = (Utc::now() - job.received_at).num_milliseconds();
        tracing::debug!(events = job.batch.events.len(), lag_ms, "Processing webhook batch");

        let mut results = Vec::with_capacity(job.batch.events.len());
        for event in &job.batch.events {
            let result = self.process_event(event).await;
            if let Err(e) = &result {
                tracing::error!(
                    workspace_id = %event.workspace_id,
                    external_message_id = %event.external_message_id,
                    error = %e,
                    "Failed to process inbound event"
                );
            }
            results.push(result);
        }
        results
    }

    pub async fn process_event(&self, event: &InboundEvent) -> AppResult<EventDisposition> {
        let lease = Duration::minutes(EVENT_LEASE_MINUTES);
        let Some(attempt) = self.store.claim_event(event, lease).await? else {
            tracing::debug!(
                workspace_id = %event.workspace_id,
                external_message_id = %event.external_message_id,
                "Duplicate delivery ignored"
            );
            return Ok(EventDisposition::Duplicate);
        };
        self.process_claimed(event, attempt).await
    }

    /// Run an event the caller holds the claim for. `attempt` counts from 1.
    pub async fn process_claimed(&self, event: &InboundEvent, attempt: i32) -> AppResult<EventDisposition> {
        let ws = event.workspace_id;

        if event.event_type == EventType::Status {
            self.record_status(event);
            self.store
                .mark_event_processed(ws, &event.external_message_id)
                .await?;
            return Ok(EventDisposition::StatusRecorded);
        }

        let thread = match self.record_message(event).await {
            Ok(thread) => thread,
            Err(e) => {
                self.defer_or_fail(event, attempt, &e.to_string(), Utc::now()).await;
                return Err(e.into());
            }
        };

        // The thread update is committed; a redelivery must not count it twice
        if let Err(e) = self
            .store
            .mark_event_processed(ws, &event.external_message_id)
            .await
        {
            tracing::error!(
                workspace_id = %ws,
                external_message_id = %event.external_message_id,
                error = %e,
                "Failed to mark inbound event processed"
            );
        }
        let text = event.text.as_deref().or(event.postback_payload.as_deref());

        let sla = self.sla.compute_for_thread(&thread, Utc::now());
        tracing::debug!(
            workspace_id = %ws,
            thread_id = %thread.id,
            due_at = ?sla.next_response_due_at,
            breached = sla.breached,
            "SLA computed"
        );

        let rule_event = RuleEvent::new_message(ws, thread.id, event.timestamp, text.map(str::to_string));
        let rules_executed = match self.engine.handle_event(rule_event).await {
            Ok(executions) => executions.len(),
            Err(e) => {
                tracing::error!(
                    workspace_id = %ws,
                    thread_id = %thread.id,
                    error = %e,
                    "Automation evaluation failed"
                );
                0
            }
        };

        let reply = self
            .ai
            .maybe_reply(thread.id, event)
            .await
            .map_err(AppError::from)?;

        Ok(EventDisposition::Processed {
            thread_id: thread.id,
            rules_executed,
            reply,
        })
    }

    async fn record_message(&self, event: &InboundEvent) -> StoreResult<Thread> {
        let ws = event.workspace_id;
        let thread = self
            .store
            .get_or_create_thread(&ThreadKey {
                workspace_id: ws,
                channel: event.provider.channel(),
                external_id: event.thread_id.clone(),
                account_id: event.account_id.clone(),
                contact_name: event.sender_name.clone(),
            })
            .await?;

        let text = event.text.as_deref().or(event.postback_payload.as_deref());
        let thread = self
            .store
            .record_customer_message(ws, thread.id, event.timestamp, text)
            .await?;
        self.store
            .set_first_response_at_if_null(ws, thread.id, event.timestamp)
            .await?;
        Ok(thread)
    }

    async fn defer_or_fail(&self, event: &InboundEvent, attempt: i32, message: &str, now: DateTime<Utc>) {
        let ws = event.workspace_id;
        let id = event.external_message_id.as_str();

        let result = match retry_decision(attempt - 1, self.max_attempts, &self.policy, now) {
            RetryDecision::Retry { attempt, run_at } => {
                tracing::warn!(
                    workspace_id = %ws,
                    external_message_id = %id,
                    attempt,
                    %run_at,
                    error = %message,
                    "Inbound event failed, retrying"
                );
                self.store.defer_event(ws, id, attempt, run_at, message).await
            }
            RetryDecision::GiveUp { attempt } => {
                tracing::error!(
                    workspace_id = %ws,
                    external_message_id = %id,
                    attempt,
                    error = %message,
                    "Inbound event failed permanently"
                );
                let result = self.store.fail_event(ws, id, attempt, message).await;
                self.audit
                    .record(CreateAuditLog {
                        workspace_id: ws,
                        actor: Actor::System,
                        action: AuditAction::InboundEventFailed,
                        resource_type: ResourceType::InboundEvent,
                        resource_id: Some(id.to_string()),
                        details: Some(json!({
                            "provider": event.provider,
                            "thread": event.thread_id,
                            "attempt": attempt,
                            "error": message,
                        })),
                    })
                    .await;
                result
            }
        };

        // The lease still expires, so the event is recovered either way
        if let Err(e) = result {
            tracing::error!(
                workspace_id = %ws,
                external_message_id = %id,
                error = %e,
                "Failed to record inbound event failure"
            );
        }
    }

    fn record_status(&self, event: &InboundEvent) {
        match event.delivery_status {
            Some(DeliveryStatus::Failed) => tracing::warn!(
                workspace_id = %event.workspace_id,
                external_message_id = %event.external_message_id,
                recipient = %event.thread_id,
                "Outbound message delivery failed"
            ),
            status => tracing::debug!(
                workspace_id = %event.workspace_id,
                external_message_id = %event.external_message_id,
                ?status,
                "Delivery status received"
            ),
        }
    }
}
