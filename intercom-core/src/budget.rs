use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Outcome of a budget check: what the caller should do and which model to
/// actually use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetAction {
    Normal,
    Alert,
    Downgrade,
    HaikuOnly,
    Offline,
}

impl BudgetAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetAction::Normal => "normal",
            BudgetAction::Alert => "alert",
            BudgetAction::Downgrade => "downgrade",
            BudgetAction::HaikuOnly => "haiku-only",
            BudgetAction::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetThresholds {
    pub alert: f64,
    pub downgrade: f64,
    pub hard_limit: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            alert: 0.80,
            downgrade: 0.95,
            hard_limit: 1.20,
        }
    }
}

/// Pure decision table from spec §4.6. `daily_budget` of 0 disables the daily
/// check. `monthly_budget` of 0 is treated as unlimited (always `normal`).
pub fn decide_action(
    spend_month: f64,
    monthly_budget: f64,
    spend_today: f64,
    daily_budget: f64,
    thresholds: &BudgetThresholds,
) -> BudgetAction {
    if daily_budget > 0.0 && spend_today >= daily_budget {
        return BudgetAction::HaikuOnly;
    }
    if monthly_budget <= 0.0 {
        return BudgetAction::Normal;
    }
    let usage_pct = spend_month / monthly_budget;
    if usage_pct >= thresholds.hard_limit {
        BudgetAction::Offline
    } else if usage_pct >= 1.0 {
        BudgetAction::HaikuOnly
    } else if usage_pct >= thresholds.downgrade {
        BudgetAction::Downgrade
    } else if usage_pct >= thresholds.alert {
        BudgetAction::Alert
    } else {
        BudgetAction::Normal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

pub fn default_price_table() -> HashMap<&'static str, ModelPrice> {
    let mut table = HashMap::new();
    table.insert("haiku", ModelPrice { input_per_million: 0.80, output_per_million: 4.00 });
    table.insert("sonnet", ModelPrice { input_per_million: 3.00, output_per_million: 15.00 });
    table.insert("opus", ModelPrice { input_per_million: 15.00, output_per_million: 75.00 });
    table
}

/// Cost of one call. Unknown models fall back to the cheapest known entry.
pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64, table: &HashMap<&'static str, ModelPrice>) -> f64 {
    let price = table.get(model).copied().unwrap_or_else(|| {
        table
            .values()
            .copied()
            .min_by(|a, b| a.input_per_million.total_cmp(&b.input_per_million))
            .unwrap_or(ModelPrice { input_per_million: 0.0, output_per_million: 0.0 })
    });
    (input_tokens as f64 * price.input_per_million + output_tokens as f64 * price.output_per_million) / 1_000_000.0
}

/// Multiplier suggested for upstream knowledge-service cache TTLs when spend
/// is elevated — cheaper cache hits matter more the closer to the limit.
pub fn adaptive_cache_ttl_multiplier(usage_pct: f64) -> f64 {
    if usage_pct >= 0.95 {
        6.0
    } else if usage_pct >= 0.80 {
        3.0
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> BudgetThresholds {
        BudgetThresholds::default()
    }

    #[test]
    fn normal_below_alert() {
        assert_eq!(decide_action(10.0, 100.0, 0.0, 0.0, &t()), BudgetAction::Normal);
    }

    #[test]
    fn alert_at_threshold() {
        assert_eq!(decide_action(80.0, 100.0, 0.0, 0.0, &t()), BudgetAction::Alert);
    }

    #[test]
    fn downgrade_at_threshold() {
        assert_eq!(decide_action(95.0, 100.0, 0.0, 0.0, &t()), BudgetAction::Downgrade);
    }

    #[test]
    fn haiku_only_at_100_pct() {
        assert_eq!(decide_action(100.0, 100.0, 0.0, 0.0, &t()), BudgetAction::HaikuOnly);
    }

    #[test]
    fn offline_at_hard_limit() {
        assert_eq!(decide_action(120.0, 100.0, 0.0, 0.0, &t()), BudgetAction::Offline);
        assert_eq!(decide_action(119.99, 100.0, 0.0, 0.0, &t()), BudgetAction::HaikuOnly);
    }

    #[test]
    fn daily_budget_overrides_monthly() {
        assert_eq!(decide_action(0.0, 1000.0, 5.0, 5.0, &t()), BudgetAction::HaikuOnly);
    }

    #[test]
    fn zero_monthly_budget_is_unlimited() {
        assert_eq!(decide_action(99999.0, 0.0, 0.0, 0.0, &t()), BudgetAction::Normal);
    }

    #[test]
    fn cost_estimation_is_linear() {
        let table = default_price_table();
        let a = estimate_cost("sonnet", 1000, 500, &table);
        let b = estimate_cost("sonnet", 2000, 1000, &table);
        assert!((b - 2.0 * a).abs() < 1e-9);
    }

    #[test]
    fn zero_tokens_zero_cost() {
        let table = default_price_table();
        assert_eq!(estimate_cost("opus", 0, 0, &table), 0.0);
    }

    #[test]
    fn unknown_model_falls_back_to_cheapest() {
        let table = default_price_table();
        let unknown = estimate_cost("mystery-model", 1_000_000, 0, &table);
        let haiku = estimate_cost("haiku", 1_000_000, 0, &table);
        assert_eq!(unknown, haiku);
    }

    #[test]
    fn cache_ttl_multiplier_scales_with_usage() {
        assert_eq!(adaptive_cache_ttl_multiplier(0.5), 1.0);
        assert_eq!(adaptive_cache_ttl_multiplier(0.85), 3.0);
        assert_eq!(adaptive_cache_ttl_multiplier(0.96), 6.0);
    }
}
