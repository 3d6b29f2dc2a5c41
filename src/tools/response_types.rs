use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backtest::DateRange;
use crate::spec::StrategySpec;

/// Response for `create_strategy_from_prompt`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateStrategyResponse {
    pub summary: String,
    pub strategy_id: i64,
    pub name: String,
    pub suggested_next_steps: Vec<String>,
}

/// Response for `run_backtest`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BacktestRunResponse {
    pub summary: String,
    pub strategy_id: i64,
    pub count: usize,
    pub date_range: Option<DateRange>,
    /// Full instance rows, present only when `return_results` was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<Map<String, Value>>>,
    pub suggested_next_steps: Vec<String>,
}

/// Response for `calculate_backtest_statistic`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatisticResponse {
    pub summary: String,
    pub strategy_id: i64,
    pub column: String,
    pub calculation: String,
    pub value: f64,
}

/// Response for `get_strategies`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategiesResponse {
    pub summary: String,
    pub total: usize,
    pub strategies: Vec<StrategyInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyInfo {
    pub strategy_id: i64,
    pub name: String,
    pub version: i64,
    pub alert_active: bool,
    pub created_at: String,
}

/// Response for `get_strategy_spec`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategySpecResponse {
    pub strategy_id: i64,
    pub name: String,
    pub spec: StrategySpec,
}

/// Response for `new_strategy`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyIdResponse {
    pub summary: String,
    pub strategy_id: i64,
}

/// Response for `set_strategy` / `delete_strategy`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AckResponse {
    pub summary: String,
}
