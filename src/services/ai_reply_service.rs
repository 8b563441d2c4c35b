//! AI auto-reply orchestrator.
//!
//! Preconditions are checked in a fixed order and the first failing one
//! becomes the decline reason. Usage is only recorded once the reply has
//! been handed to the channel, so a failed provider call or a failed send
//! never costs the workspace tokens.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{ProviderError, StoreResult},
    models::{
        AIReplyLog, AIReplySettings, Actor, AuditAction, ChatMessage, ChatRole, CreateAuditLog, HandoffState,
        InboundEvent, Prompt, ProviderReply, ReplyOutcome, ReplyReason, ResourceType, Thread, ThreadAIState,
    },
    services::{
        ai_provider::{estimate_tokens, ProviderRegistry},
        audit_service::AuditService,
        channel_service::MessageSender,
        usage_service::UsageService,
    },
    store::Store,
};

/// Check the reply preconditions in order. `None` means every check passed.
pub fn check_preconditions(
    settings: &AIReplySettings,
    thread: &Thread,
    ai_state: &ThreadAIState,
    month_to_date_tokens: i64,
    recipient: &str,
) -> Option<ReplyReason> {
    if !settings.allow_automation {
        return Some(ReplyReason::WorkspaceDisabled);
    }
    if !thread.ai_enabled {
        return Some(ReplyReason::ThreadDisabled);
    }
    if ai_state.handoff.is_active() {
        return Some(ReplyReason::HandoffActive);
    }
    if settings
        .monthly_token_cap
        .is_some_and(|cap| month_to_date_tokens >= cap)
    {
        return Some(ReplyReason::CapExceeded);
    }
    if settings.sandbox_enabled && !settings.is_whitelisted(recipient) {
        return Some(ReplyReason::SandboxBlocked);
    }
    None
}

/// Text the model should answer: the message body, or a postback payload
pub fn inbound_content(event: &InboundEvent) -> Option<&str> {
    event
        .text
        .as_deref()
        .or(event.postback_payload.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn build_prompt(settings: &AIReplySettings, thread: &Thread, content: &str) -> Prompt {
    let mut system = settings.system_prompt.clone();
    if let Some(name) = thread.contact_name.as_deref() {
        system.push_str(&format!("\n\nThe customer's name is {name}."));
    }

    Prompt {
        model: settings.model.clone(),
        max_tokens: settings.max_output_tokens,
        temperature: settings.temperature,
        messages: vec![
            ChatMessage {
                role: ChatRole::System,
                content: system,
            },
            ChatMessage {
                role: ChatRole::User,
                content: content.to_string(),
            },
        ],
    }
}

#[derive(Clone)]
pub struct AiReplyService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    sender: Arc<dyn MessageSender>,
    usage: UsageService,
    audit: AuditService,
    timeout: Duration,
}

impl AiReplyService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        sender: Arc<dyn MessageSender>,
        audit: AuditService,
        timeout: Duration,
    ) -> Self {
        Self {
            usage: UsageService::new(store.clone()),
            store,
            providers,
            sender,
            audit,
            timeout,
        }
    }

    /// Decide whether to auto-reply to `event` on `thread_id`, and reply if so
    pub async fn maybe_reply(&self, thread_id: Uuid, event: &InboundEvent) -> StoreResult<ReplyOutcome> {
        let ws = event.workspace_id;
        let now = Utc::now();

        let settings = self.store.get_ai_settings(ws).await?;
        let thread = self.store.get_thread(ws, thread_id).await?;
        let ai_state = self.store.get_thread_ai_state(ws, thread_id).await?;
        // Only read usage when a cap can actually decline the reply
        let month_to_date = match settings.monthly_token_cap {
            Some(_) if settings.allow_automation => self.usage.month_to_date_tokens(ws, now).await?,
            _ => 0,
        };

        if let Some(reason) = check_preconditions(&settings, &thread, &ai_state, month_to_date, &event.sender_id) {
            tracing::debug!(
                workspace_id = %ws,
                thread_id = %thread_id,
                external_message_id = %event.external_message_id,
                %reason,
                "AI reply declined"
            );
            self.log_decision(event, thread_id, &ReplyOutcome::declined(reason), None, None)
                .await;
            return Ok(ReplyOutcome::declined(reason));
        }

        let Some(content) = inbound_content(event) else {
            let outcome = ReplyOutcome::declined(ReplyReason::NoContent);
            self.log_decision(event, thread_id, &outcome, None, None).await;
            return Ok(outcome);
        };

        let prompt = build_prompt(&settings, &thread, content);
        let reply = match self.call_provider(&settings, &prompt).await {
            Ok(reply) if !reply.text.trim().is_empty() => reply,
            Ok(_) => {
                let error = ProviderError::CallFailed("provider returned an empty reply".to_string());
                return Ok(self.provider_failed(event, thread_id, &settings, error).await);
            }
            Err(error) => return Ok(self.provider_failed(event, thread_id, &settings, error).await),
        };

        if let Err(e) = self.sender.send_text(&thread, &reply.text).await {
            tracing::error!(
                workspace_id = %ws,
                thread_id = %thread_id,
                external_message_id = %event.external_message_id,
                error = %e,
                "AI reply generated but not delivered"
            );
            let outcome = ReplyOutcome::declined(ReplyReason::SendFailed);
            self.log_decision(event, thread_id, &outcome, Some(&settings), Some(&e.to_string()))
                .await;
            return Ok(outcome);
        }

        let tokens_in = reply.tokens_in.unwrap_or_else(|| estimate_tokens(&prompt.full_text()));
        let tokens_out = reply.tokens_out.unwrap_or_else(|| estimate_tokens(&reply.text));
        let sent_at = Utc::now();

        self.usage
            .record(ws, &settings.provider.to_string(), &settings.model, tokens_in, tokens_out, sent_at)
            .await?;
        self.store.record_agent_reply(ws, thread_id, sent_at).await?;
        self.store.set_first_response_at_if_null(ws, thread_id, sent_at).await?;
        self.store.record_ai_reply(ws, thread_id, sent_at).await?;

        let outcome = ReplyOutcome {
            replied: true,
            reason: ReplyReason::Replied,
            tokens_in,
            tokens_out,
        };
        self.log_decision(event, thread_id, &outcome, Some(&settings), None).await;
        self.audit
            .record(CreateAuditLog {
                workspace_id: ws,
                actor: Actor::System,
                action: AuditAction::AiReplySent,
                resource_type: ResourceType::Thread,
                resource_id: Some(thread_id.to_string()),
                details: Some(json!({
                    "provider": settings.provider,
                    "model": settings.model,
                    "tokens_in": tokens_in,
                    "tokens_out": tokens_out,
                })),
            })
            .await;

        tracing::info!(
            workspace_id = %ws,
            thread_id = %thread_id,
            tokens_in,
            tokens_out,
            "AI reply sent"
        );
        Ok(outcome)
    }

    async fn call_provider(
        &self,
        settings: &AIReplySettings,
        prompt: &Prompt,
    ) -> Result<ProviderReply, ProviderError> {
        let provider = self.providers.get(settings.provider)?;
        tokio::time::timeout(self.timeout, provider.complete(prompt))
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))?
    }

    async fn provider_failed(
        &self,
        event: &InboundEvent,
        thread_id: Uuid,
        settings: &AIReplySettings,
        error: ProviderError,
    ) -> ReplyOutcome {
        tracing::error!(
            workspace_id = %event.workspace_id,
            thread_id = %thread_id,
            external_message_id = %event.external_message_id,
            provider = %settings.provider,
            error = %error,
            "AI provider call failed"
        );
        let outcome = ReplyOutcome::declined(ReplyReason::ProviderCallFailed);
        self.log_decision(event, thread_id, &outcome, Some(settings), Some(&error.to_string()))
            .await;
        self.audit
            .record(CreateAuditLog {
                workspace_id: event.workspace_id,
                actor: Actor::System,
                action: AuditAction::AiReplyFailed,
                resource_type: ResourceType::Thread,
                resource_id: Some(thread_id.to_string()),
                details: Some(json!({
                    "provider": settings.provider,
                    "error": error.to_string(),
                })),
            })
            .await;
        outcome
    }

    async fn log_decision(
        &self,
        event: &InboundEvent,
        thread_id: Uuid,
        outcome: &ReplyOutcome,
        settings: Option<&AIReplySettings>,
        error: Option<&str>,
    ) {
        let log = AIReplyLog {
            id: Uuid::new_v4(),
            workspace_id: event.workspace_id,
            thread_id,
            external_message_id: event.external_message_id.clone(),
            replied: outcome.replied,
            reason: outcome.reason.to_string(),
            provider: settings.map(|s| s.provider.to_string()),
            model: settings.map(|s| s.model.clone()),
            tokens_in: outcome.tokens_in as i64,
            tokens_out: outcome.tokens_out as i64,
            error: error.map(str::to_string),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_ai_log(&log).await {
            tracing::warn!(thread_id = %thread_id, error = %e, "Failed to write AI reply log");
        }
    }

    /// Hand a thread to a human. A user doing it takes the thread over
    /// immediately; a rule only flags it as pending.
    pub async fn trigger_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        reason: Option<&str>,
        actor: Actor,
    ) -> StoreResult<ThreadAIState> {
        self.store.get_thread(workspace_id, thread_id).await?;
        let state = match actor {
            Actor::User(_) => HandoffState::HandedOff,
            _ => HandoffState::Pending,
        };
        let updated = self
            .store
            .set_handoff(workspace_id, thread_id, state, reason, Utc::now())
            .await?;

        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::HandoffTriggered,
                resource_type: ResourceType::Thread,
                resource_id: Some(thread_id.to_string()),
                details: Some(json!({ "state": updated.handoff, "reason": reason })),
            })
            .await;
        Ok(updated)
    }

    /// Return a thread to AI handling
    pub async fn reset_handoff(&self, workspace_id: Uuid, thread_id: Uuid, actor: Actor) -> StoreResult<ThreadAIState> {
        self.store.get_thread(workspace_id, thread_id).await?;
        let updated = self
            .store
            .set_handoff(workspace_id, thread_id, HandoffState::None, None, Utc::now())
            .await?;
        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::HandoffReset,
                resource_type: ResourceType::Thread,
                resource_id: Some(thread_id.to_string()),
                details: None,
            })
            .await;
        Ok(updated)
    }

    /// A human replied on the thread; a pending handoff is now complete
    pub async fn complete_pending_handoff(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<ThreadAIState> {
        let state = self.store.get_thread_ai_state(workspace_id, thread_id).await?;
        if state.handoff != HandoffState::Pending {
            return Ok(state);
        }
        self.store
            .set_handoff(workspace_id, thread_id, HandoffState::HandedOff, state.handoff_reason.as_deref(), at)
            .await
    }

    pub async fn set_thread_enabled(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        enabled: bool,
        actor: Actor,
    ) -> StoreResult<Thread> {
        let thread = self
            .store
            .set_thread_ai_enabled(workspace_id, thread_id, enabled)
            .await?;
        self.audit
            .record(CreateAuditLog {
                workspace_id,
                actor,
                action: AuditAction::ThreadAiToggled,
                resource_type: ResourceType::Thread,
                resource_id: Some(thread_id.to_string()),
                details: Some(json!({ "ai_enabled": enabled })),
            })
            .await;
        Ok(thread)
    }

    pub fn usage(&self) -> &UsageService {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, LLMProvider};

    fn enabled_settings() -> AIReplySettings {
        let mut settings = AIReplySettings::disabled(Uuid::new_v4());
        settings.allow_automation = true;
        settings
    }

    fn thread(ws: Uuid) -> Thread {
        Thread::new(ws, Channel::Whatsapp, "15551234567", "phone-1")
    }

    #[test]
    fn test_all_preconditions_pass() {
        let settings = enabled_settings();
        let th = thread(settings.workspace_id);
        let state = ThreadAIState::initial(th.workspace_id, th.id);
        assert_eq!(check_preconditions(&settings, &th, &state, 0, "15551234567"), None);
    }

    #[test]
    fn test_workspace_disabled_checked_first() {
        let mut settings = AIReplySettings::disabled(Uuid::new_v4());
        settings.sandbox_enabled = true;
        settings.monthly_token_cap = Some(0);
        let mut th = thread(settings.workspace_id);
        th.ai_enabled = false;
        let mut state = ThreadAIState::initial(th.workspace_id, th.id);
        state.handoff = HandoffState::HandedOff;

        assert_eq!(
            check_preconditions(&settings, &th, &state, 10, "x"),
            Some(ReplyReason::WorkspaceDisabled)
        );
    }

    #[test]
    fn test_each_precondition_has_its_own_reason() {
        let settings = enabled_settings();
        let th = thread(settings.workspace_id);
        let state = ThreadAIState::initial(th.workspace_id, th.id);

        let mut disabled_thread = th.clone();
        disabled_thread.ai_enabled = false;
        assert_eq!(
            check_preconditions(&settings, &disabled_thread, &state, 0, "x"),
            Some(ReplyReason::ThreadDisabled)
        );

        let mut pending = state.clone();
        pending.handoff = HandoffState::Pending;
        assert_eq!(
            check_preconditions(&settings, &th, &pending, 0, "x"),
            Some(ReplyReason::HandoffActive)
        );

        let mut capped = settings.clone();
        capped.monthly_token_cap = Some(1000);
        assert_eq!(
            check_preconditions(&capped, &th, &state, 1000, "x"),
            Some(ReplyReason::CapExceeded)
        );
        assert_eq!(check_preconditions(&capped, &th, &state, 999, "x"), None);

        let mut sandboxed = settings.clone();
        sandboxed.sandbox_enabled = true;
        sandboxed.sandbox_whitelist = vec!["15550000000".into()];
        assert_eq!(
            check_preconditions(&sandboxed, &th, &state, 0, "15551234567"),
            Some(ReplyReason::SandboxBlocked)
        );
        assert_eq!(check_preconditions(&sandboxed, &th, &state, 0, "15550000000"), None);
    }

    #[test]
    fn test_build_prompt_uses_settings() {
        let mut settings = enabled_settings();
        settings.provider = LLMProvider::OpenAI;
        settings.model = "gpt-4o-mini".into();
        let mut th = thread(settings.workspace_id);
        th.contact_name = Some("Ana".into());

        let prompt = build_prompt(&settings, &th, "Where is my order?");
        assert_eq!(prompt.model, "gpt-4o-mini");
        assert_eq!(prompt.messages.len(), 2);
        assert!(prompt.messages[0].content.contains("Ana"));
        assert_eq!(prompt.messages[1].content, "Where is my order?");
    }
}
