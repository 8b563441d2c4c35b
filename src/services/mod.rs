pub mod ai_provider;
pub mod ai_reply_service;
pub mod audit_service;
pub mod auth_service;
pub mod automation_service;
pub mod backoff_service;
pub mod channel_service;
pub mod normalizer_service;
pub mod pipeline_service;
pub mod provider_types;
pub mod rule_service;
pub mod scheduler_service;
pub mod signature_service;
pub mod sla_service;
pub mod usage_service;

pub use ai_provider::{AiProvider, AnthropicProvider, OpenAIProvider, ProviderRegistry};
pub use ai_reply_service::AiReplyService;
pub use audit_service::AuditService;
pub use auth_service::{AuthService, Claims};
pub use automation_service::AutomationEngine;
pub use backoff_service::BackoffPolicy;
pub use channel_service::{MessageSender, WhatsAppCloudSender};
pub use pipeline_service::{PipelineWorker, WebhookJob};
pub use rule_service::RuleService;
pub use scheduler_service::Scheduler;
pub use sla_service::{SlaBudgets, SlaService};
pub use usage_service::UsageService;
