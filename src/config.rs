use anyhow::Result;
use secrecy::SecretString;
use serde::Deserialize;

use crate::models::Priority;
use crate::services::backoff_service::BackoffPolicy;

/// Application configuration loaded from environment variables
#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    pub jwt_secret: SecretString,

    /// Meta app secret used for `X-Hub-Signature-256` and signed requests
    pub whatsapp_app_secret: Option<SecretString>,

    /// Token echoed back by Meta during the GET subscription handshake
    pub whatsapp_verify_token: SecretString,

    /// Graph API bearer token for outbound sends
    pub whatsapp_access_token: Option<SecretString>,

    #[serde(default = "default_graph_api_base_url")]
    pub graph_api_base_url: String,

    pub openai_api_key: Option<SecretString>,

    pub anthropic_api_key: Option<SecretString>,

    #[serde(default = "default_ai_provider_timeout")]
    pub ai_provider_timeout_secs: u64,

    #[serde(default = "default_webhook_queue_capacity")]
    pub webhook_queue_capacity: usize,

    #[serde(default = "default_backoff_base_minutes")]
    pub backoff_base_minutes: f64,

    #[serde(default = "default_backoff_max_minutes")]
    pub backoff_max_minutes: f64,

    #[serde(default = "default_backoff_jitter_ratio")]
    pub backoff_jitter_ratio: f64,

    #[serde(default = "default_scheduler_poll_interval")]
    pub scheduler_poll_interval_secs: u64,

    #[serde(default = "default_scheduler_batch_size")]
    pub scheduler_batch_size: i64,

    #[serde(default = "default_scheduler_max_attempts")]
    pub scheduler_max_attempts: i32,

    #[serde(default = "default_sla_urgent")]
    pub sla_urgent_minutes: i64,

    #[serde(default = "default_sla_high")]
    pub sla_high_minutes: i64,

    #[serde(default = "default_sla_medium")]
    pub sla_medium_minutes: i64,

    #[serde(default = "default_sla_low")]
    pub sla_low_minutes: i64,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u64,

    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,

    /// When set, rate-limit counters live in Redis instead of process memory
    pub redis_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> u32 {
    10
}

fn default_graph_api_base_url() -> String {
    "https://graph.facebook.com/v19.0".to_string()
}

fn default_ai_provider_timeout() -> u64 {
    20
}

fn default_webhook_queue_capacity() -> usize {
    1024
}

fn default_backoff_base_minutes() -> f64 {
    1.0
}

fn default_backoff_max_minutes() -> f64 {
    60.0
}

fn default_backoff_jitter_ratio() -> f64 {
    0.2
}

fn default_scheduler_poll_interval() -> u64 {
    30
}

fn default_scheduler_batch_size() -> i64 {
    50
}

fn default_scheduler_max_attempts() -> i32 {
    5
}

fn default_sla_urgent() -> i64 {
    15
}

fn default_sla_high() -> i64 {
    60
}

fn default_sla_medium() -> i64 {
    240
}

fn default_sla_low() -> i64 {
    1440
}

fn default_rate_limit_max_requests() -> u64 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_minutes: self.backoff_base_minutes,
            max_minutes: self.backoff_max_minutes,
            jitter_ratio: self.backoff_jitter_ratio,
        }
    }

    /// Response-time budget in minutes for a priority tier
    pub fn sla_budget_minutes(&self, priority: Priority) -> i64 {
        match priority {
            Priority::Urgent => self.sla_urgent_minutes,
            Priority::High => self.sla_high_minutes,
            Priority::Medium => self.sla_medium_minutes,
            Priority::Low => self.sla_low_minutes,
        }
    }

    /// Configuration with every default applied, for tests and local tooling
    pub fn for_testing() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: "postgres://localhost/inboxpilot_test".to_string(),
            database_max_connections: 5,
            jwt_secret: SecretString::from("test-jwt-secret"),
            whatsapp_app_secret: Some(SecretString::from("test-app-secret")),
            whatsapp_verify_token: SecretString::from("test-verify-token"),
            whatsapp_access_token: None,
            graph_api_base_url: default_graph_api_base_url(),
            openai_api_key: None,
            anthropic_api_key: None,
            ai_provider_timeout_secs: default_ai_provider_timeout(),
            webhook_queue_capacity: default_webhook_queue_capacity(),
            backoff_base_minutes: default_backoff_base_minutes(),
            backoff_max_minutes: default_backoff_max_minutes(),
            backoff_jitter_ratio: default_backoff_jitter_ratio(),
            scheduler_poll_interval_secs: default_scheduler_poll_interval(),
            scheduler_batch_size: default_scheduler_batch_size(),
            scheduler_max_attempts: default_scheduler_max_attempts(),
            sla_urgent_minutes: default_sla_urgent(),
            sla_high_minutes: default_sla_high(),
            sla_medium_minutes: default_sla_medium(),
            sla_low_minutes: default_sla_low(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            rate_limit_window_secs: default_rate_limit_window(),
            redis_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sla_budgets_are_ordered_by_priority() {
        let config = Config::for_testing();
        assert!(config.sla_budget_minutes(Priority::Urgent) < config.sla_budget_minutes(Priority::High));
        assert!(config.sla_budget_minutes(Priority::High) < config.sla_budget_minutes(Priority::Medium));
        assert!(config.sla_budget_minutes(Priority::Medium) < config.sla_budget_minutes(Priority::Low));
    }

    #[test]
    fn test_backoff_policy_reflects_config() {
        let mut config = Config::for_testing();
        config.backoff_base_minutes = 2.0;
        config.backoff_max_minutes = 30.0;
        let policy = config.backoff_policy();
        assert_eq!(policy.base_minutes, 2.0);
        assert_eq!(policy.max_minutes, 30.0);
    }
}
