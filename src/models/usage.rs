use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token usage of a single delivered AI reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageDelta {
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
}

/// Per-provider slice of a daily usage record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderUsage {
    pub provider: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub calls: i64,
}

/// Daily usage for a workspace. Append/accumulate only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub workspace_id: Uuid,
    pub day: NaiveDate,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub providers: Vec<ProviderUsage>,
}

impl UsageRecord {
    /// Fold provider rows of a single day into one record
    pub fn from_providers(workspace_id: Uuid, day: NaiveDate, providers: Vec<ProviderUsage>) -> Self {
        let tokens_in = providers.iter().map(|p| p.tokens_in).sum();
        let tokens_out = providers.iter().map(|p| p.tokens_out).sum();
        let cost_usd = providers.iter().map(|p| p.cost_usd).sum();
        Self {
            workspace_id,
            day,
            tokens_in,
            tokens_out,
            cost_usd,
            providers,
        }
    }

    pub fn total_tokens(&self) -> i64 {
        self.tokens_in + self.tokens_out
    }
}

/// Aggregated usage for the stats endpoint
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageSummary {
    pub workspace_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub month_to_date_tokens: i64,
    pub monthly_token_cap: Option<i64>,
    pub days: Vec<UsageRecord>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_providers_sums_columns() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let record = UsageRecord::from_providers(
            Uuid::nil(),
            day,
            vec![
                ProviderUsage {
                    provider: "openai".into(),
                    tokens_in: 100,
                    tokens_out: 20,
                    cost_usd: 0.5,
                    calls: 2,
                },
                ProviderUsage {
                    provider: "anthropic".into(),
                    tokens_in: 50,
                    tokens_out: 30,
                    cost_usd: 0.25,
                    calls: 1,
                },
            ],
        );
        assert_eq!(record.tokens_in, 150);
        assert_eq!(record.tokens_out, 50);
        assert_eq!(record.total_tokens(), 200);
        assert!((record.cost_usd - 0.75).abs() < f64::EPSILON);
    }
}
