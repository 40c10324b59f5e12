use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use super::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostUsage {
    pub user_id: String,
    pub tier: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost_usd: f64,
    pub response_time_ms: i64,
    pub group_id: String,
    pub trace_id: Option<String>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBudget {
    pub group_id: String,
    pub monthly_budget: f64,
    pub daily_budget: f64,
    #[serde(default = "default_alert_thresh")]
    pub alert_thresh: f64,
    #[serde(default = "default_downgrade_thresh")]
    pub downgrade_thresh: f64,
    #[serde(default = "default_hard_limit_thresh")]
    pub hard_limit_thresh: f64,
    pub preferred_model: String,
    pub downgrade_model: String,
}

fn default_alert_thresh() -> f64 {
    0.80
}
fn default_downgrade_thresh() -> f64 {
    0.95
}
fn default_hard_limit_thresh() -> f64 {
    1.20
}

pub(super) async fn ensure_schema(client: &Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "\
            CREATE TABLE IF NOT EXISTS cost_usage (
              id SERIAL PRIMARY KEY,
              user_id TEXT NOT NULL,
              tier TEXT NOT NULL,
              model TEXT NOT NULL,
              input_tokens BIGINT NOT NULL DEFAULT 0,
              output_tokens BIGINT NOT NULL DEFAULT 0,
              estimated_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
              response_time_ms BIGINT NOT NULL DEFAULT 0,
              group_id TEXT NOT NULL,
              trace_id TEXT,
              cache_hit BOOLEAN NOT NULL DEFAULT FALSE,
              timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS idx_cost_usage_group_time ON cost_usage(group_id, timestamp);

            CREATE TABLE IF NOT EXISTS cost_budgets (
              group_id TEXT PRIMARY KEY,
              monthly_budget DOUBLE PRECISION NOT NULL DEFAULT 0,
              daily_budget DOUBLE PRECISION NOT NULL DEFAULT 0,
              alert_thresh DOUBLE PRECISION NOT NULL DEFAULT 0.80,
              downgrade_thresh DOUBLE PRECISION NOT NULL DEFAULT 0.95,
              hard_limit_thresh DOUBLE PRECISION NOT NULL DEFAULT 1.20,
              preferred_model TEXT NOT NULL DEFAULT 'sonnet',
              downgrade_model TEXT NOT NULL DEFAULT 'haiku'
            );

            CREATE TABLE IF NOT EXISTS alert_log (
              group_id TEXT NOT NULL,
              alert_type TEXT NOT NULL,
              fired_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              PRIMARY KEY (group_id, alert_type, fired_at)
            );
            ",
        )
        .await
        .context("failed to create ledger schema")
}

impl PgPool {
    pub async fn track_usage(&self, usage: &CostUsage) -> anyhow::Result<()> {
        self.with_client(|client| {
            let usage = usage.clone();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO cost_usage
                          (user_id, tier, model, input_tokens, output_tokens, estimated_cost_usd,
                           response_time_ms, group_id, trace_id, cache_hit)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        ",
                        &[
                            &usage.user_id, &usage.tier, &usage.model, &usage.input_tokens,
                            &usage.output_tokens, &usage.estimated_cost_usd, &usage.response_time_ms,
                            &usage.group_id, &usage.trace_id, &usage.cache_hit,
                        ],
                    )
                    .await
                    .context("track_usage")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_budget(&self, group_id: &str) -> anyhow::Result<Option<CostBudget>> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM cost_budgets WHERE group_id = $1", &[&group_id])
                    .await
                    .context("get_budget")?;
                Ok(row.map(|r| row_to_budget(&r)))
            })
        })
        .await
    }

    pub async fn set_budget(&self, budget: &CostBudget) -> anyhow::Result<()> {
        self.with_client(|client| {
            let budget = budget.clone();
            Box::pin(async move {
                client
                    .execute(
                        "\
                        INSERT INTO cost_budgets
                          (group_id, monthly_budget, daily_budget, alert_thresh, downgrade_thresh,
                           hard_limit_thresh, preferred_model, downgrade_model)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        ON CONFLICT (group_id) DO UPDATE SET
                          monthly_budget = EXCLUDED.monthly_budget,
                          daily_budget = EXCLUDED.daily_budget,
                          alert_thresh = EXCLUDED.alert_thresh,
                          downgrade_thresh = EXCLUDED.downgrade_thresh,
                          hard_limit_thresh = EXCLUDED.hard_limit_thresh,
                          preferred_model = EXCLUDED.preferred_model,
                          downgrade_model = EXCLUDED.downgrade_model
                        ",
                        &[
                            &budget.group_id, &budget.monthly_budget, &budget.daily_budget,
                            &budget.alert_thresh, &budget.downgrade_thresh, &budget.hard_limit_thresh,
                            &budget.preferred_model, &budget.downgrade_model,
                        ],
                    )
                    .await
                    .context("set_budget")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn spend_month_to_date(&self, group_id: &str) -> anyhow::Result<f64> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_one(
                        "\
                        SELECT COALESCE(SUM(estimated_cost_usd), 0) AS total FROM cost_usage
                        WHERE group_id = $1 AND timestamp >= date_trunc('month', now())
                        ",
                        &[&group_id],
                    )
                    .await
                    .context("spend_month_to_date")?;
                Ok(row.get("total"))
            })
        })
        .await
    }

    pub async fn spend_today(&self, group_id: &str) -> anyhow::Result<f64> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_one(
                        "\
                        SELECT COALESCE(SUM(estimated_cost_usd), 0) AS total FROM cost_usage
                        WHERE group_id = $1 AND timestamp >= date_trunc('day', now())
                        ",
                        &[&group_id],
                    )
                    .await
                    .context("spend_today")?;
                Ok(row.get("total"))
            })
        })
        .await
    }

    /// Returns true (and records the firing) iff no alert of this type has
    /// fired for this group within the last hour — caller uses this to decide
    /// whether to actually notify.
    pub async fn should_fire_alert(&self, group_id: &str, alert_type: &str) -> anyhow::Result<bool> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            let alert_type = alert_type.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "\
                        SELECT 1 FROM alert_log
                        WHERE group_id = $1 AND alert_type = $2 AND fired_at >= now() - interval '1 hour'
                        LIMIT 1
                        ",
                        &[&group_id, &alert_type],
                    )
                    .await
                    .context("should_fire_alert_check")?;
                if row.is_some() {
                    return Ok(false);
                }
                client
                    .execute(
                        "INSERT INTO alert_log (group_id, alert_type) VALUES ($1, $2)",
                        &[&group_id, &alert_type],
                    )
                    .await
                    .context("should_fire_alert_insert")?;
                Ok(true)
            })
        })
        .await
    }
}

fn row_to_budget(r: &tokio_postgres::Row) -> CostBudget {
    CostBudget {
        group_id: r.get("group_id"),
        monthly_budget: r.get("monthly_budget"),
        daily_budget: r.get("daily_budget"),
        alert_thresh: r.get("alert_thresh"),
        downgrade_thresh: r.get("downgrade_thresh"),
        hard_limit_thresh: r.get("hard_limit_thresh"),
        preferred_model: r.get("preferred_model"),
        downgrade_model: r.get("downgrade_model"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_defaults_fill_in() {
        let json = r#"{"group_id":"main","monthly_budget":100.0,"daily_budget":10.0,"preferred_model":"sonnet","downgrade_model":"haiku"}"#;
        let budget: CostBudget = serde_json::from_str(json).unwrap();
        assert_eq!(budget.alert_thresh, 0.80);
        assert_eq!(budget.hard_limit_thresh, 1.20);
    }
}
