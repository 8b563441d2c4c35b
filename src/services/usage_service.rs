use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
    error::StoreResult,
    models::{UsageDelta, UsageSummary},
    store::Store,
};

/// Price per million tokens in USD, `(input, output)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Known model prices, matched by model-name prefix. Longer prefixes first.
const PRICE_TABLE: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
    ("claude-sonnet-4", ModelPrice { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-3-5-haiku", ModelPrice { input_per_mtok: 0.8, output_per_mtok: 4.0 }),
    ("claude-3-haiku", ModelPrice { input_per_mtok: 0.25, output_per_mtok: 1.25 }),
    ("gpt-4o-mini", ModelPrice { input_per_mtok: 0.15, output_per_mtok: 0.6 }),
    ("gpt-4o", ModelPrice { input_per_mtok: 2.5, output_per_mtok: 10.0 }),
    ("gpt-4.1-mini", ModelPrice { input_per_mtok: 0.4, output_per_mtok: 1.6 }),
    ("gpt-4.1", ModelPrice { input_per_mtok: 2.0, output_per_mtok: 8.0 }),
];

/// Price for a model, or `None` when unknown (cost is then recorded as 0)
pub fn price_for(model: &str) -> Option<ModelPrice> {
    PRICE_TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, price)| *price)
}

pub fn estimate_cost_usd(model: &str, tokens_in: i64, tokens_out: i64) -> f64 {
    price_for(model).map_or(0.0, |p| {
        (tokens_in.max(0) as f64 * p.input_per_mtok + tokens_out.max(0) as f64 * p.output_per_mtok)
            / 1_000_000.0
    })
}

/// First day of the month containing `day`
pub fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

/// Token and cost accounting for delivered AI replies
#[derive(Clone)]
pub struct UsageService {
    store: Arc<dyn Store>,
}

impl UsageService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Accumulate one delivered reply into the day bucket of `at`
    pub async fn record(
        &self,
        workspace_id: Uuid,
        provider: &str,
        model: &str,
        tokens_in: u32,
        tokens_out: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<UsageDelta> {
        let delta = UsageDelta {
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_in: tokens_in as i64,
            tokens_out: tokens_out as i64,
            cost_usd: estimate_cost_usd(model, tokens_in as i64, tokens_out as i64),
        };
        self.store
            .accumulate_usage(workspace_id, at.date_naive(), &delta)
            .await?;
        Ok(delta)
    }

    /// Tokens used since the start of the month containing `now`
    pub async fn month_to_date_tokens(&self, workspace_id: Uuid, now: DateTime<Utc>) -> StoreResult<i64> {
        self.store
            .tokens_since(workspace_id, month_start(now.date_naive()))
            .await
    }

    /// Usage for the trailing `days` days ending today
    pub async fn summary(
        &self,
        workspace_id: Uuid,
        days: i64,
        monthly_token_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageSummary> {
        let to = now.date_naive();
        let from = to - Duration::days(days.clamp(1, 366) - 1);
        let records = self.store.usage_between(workspace_id, from, to).await?;
        let month_to_date_tokens = self.month_to_date_tokens(workspace_id, now).await?;

        Ok(UsageSummary {
            workspace_id,
            from,
            to,
            tokens_in: records.iter().map(|r| r.tokens_in).sum(),
            tokens_out: records.iter().map(|r| r.tokens_out).sum(),
            cost_usd: records.iter().map(|r| r.cost_usd).sum(),
            month_to_date_tokens,
            monthly_token_cap,
            days: records,
            generated_at: now,
        })
    }
}
