use std::collections::HashMap;
use std::sync::Arc;

use garde::Validate;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Json, wrapper::Parameters},
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::AppContext;
use crate::derive::TableResponse;
use crate::spec::StrategySpec;
use crate::tools;
use crate::tools::response_types::{
    AckResponse, BacktestRunResponse, CreateStrategyResponse, StatisticResponse,
    StrategiesResponse, StrategyIdResponse, StrategySpecResponse,
};

#[derive(Clone)]
pub struct ScreenerServer {
    pub ctx: Arc<AppContext>,
    tool_router: ToolRouter<Self>,
}

impl ScreenerServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }
}

fn default_new_strategy_id() -> i64 {
    -1
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct CreateStrategyFromPromptParams {
    /// Natural-language strategy description, e.g. "gold gapped up over 3% over the last year"
    #[garde(length(min = 1, max = 4000))]
    pub query: String,
    /// Strategy id to overwrite, or -1 to create a new strategy (default)
    #[serde(default = "default_new_strategy_id")]
    #[garde(range(min = -1))]
    pub strategy_id: i64,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct RunBacktestParams {
    /// Strategy id returned by create_strategy_from_prompt or new_strategy
    #[garde(range(min = 1))]
    pub strategy_id: i64,
    /// Include the full instance rows in the response (default: summary only)
    #[serde(default)]
    #[garde(skip)]
    pub return_results: bool,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct CalculateStatisticParams {
    /// Strategy id with a cached backtest result
    #[garde(range(min = 1))]
    pub strategy_id: i64,
    /// Result column to aggregate (a feature name, or "timestamp"/"securityId")
    #[garde(length(min = 1, max = 100), pattern(r"^[A-Za-z_][A-Za-z0-9_]*$"))]
    pub column_name: String,
    /// One of: average, sum, min, max, count
    #[garde(length(min = 1, max = 20))]
    pub calculation_type: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct GenerateTableParams {
    /// Strategy id with a cached backtest result
    #[garde(range(min = 1))]
    pub strategy_id: i64,
    /// Result columns to project (ticker/timestamp are folded into the instance column)
    #[garde(length(min = 1), inner(length(min = 1, max = 100)))]
    pub columns: Vec<String>,
    /// Optional internal-name → display-header mapping
    #[garde(skip)]
    pub column_mapping: Option<HashMap<String, String>>,
    /// Optional per-column float format, e.g. {"gap": "%.4f"}
    #[garde(skip)]
    pub column_format: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct GetStrategySpecParams {
    #[garde(range(min = 1))]
    pub strategy_id: i64,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct NewStrategyParams {
    /// Human-readable strategy name
    #[garde(length(min = 1, max = 200))]
    pub name: String,
    /// Full strategy specification (name-form universe filters)
    #[garde(skip)]
    pub spec: StrategySpec,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SetStrategyParams {
    #[garde(range(min = 1))]
    pub strategy_id: i64,
    /// New name, when renaming
    #[garde(inner(length(min = 1, max = 200)))]
    pub name: Option<String>,
    /// Replacement spec, when changing the strategy
    #[garde(skip)]
    pub spec: Option<StrategySpec>,
    /// Toggle near-real-time alert evaluation for this strategy
    #[garde(skip)]
    pub alert_active: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DeleteStrategyParams {
    #[garde(range(min = 1))]
    pub strategy_id: i64,
}

#[tool_router]
impl ScreenerServer {
    /// Turn a natural-language trading strategy description into a stored,
    /// validated strategy. **START HERE.**
    ///
    /// **When to use**: Any time the user describes a screen or strategy in
    /// prose ("top-decile tech stocks whose 20-day change beats the sector
    /// average by 5%").
    /// **How it works**: The description goes through a bounded synthesis
    /// loop: the model proposes a `{name, spec}` object, the validator
    /// checks it against the vocabulary and structural invariants, and any
    /// diagnostics are fed back for self-repair (3 attempts).
    /// **Next tool**: `run_backtest` with the returned `strategy_id`.
    #[tool(
        name = "create_strategy_from_prompt",
        annotations(destructive_hint = false, idempotent_hint = false, open_world_hint = true)
    )]
    async fn create_strategy_from_prompt(
        &self,
        Parameters(params): Parameters<CreateStrategyFromPromptParams>,
    ) -> Result<Json<CreateStrategyResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        let overwrite = (params.strategy_id >= 0).then_some(params.strategy_id);
        tools::strategy::create_from_prompt(&self.ctx, &params.query, overwrite)
            .await
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Run a strategy's backtest over the historical market data.
    ///
    /// **Prerequisites**: a strategy created via `create_strategy_from_prompt`
    /// or `new_strategy`.
    /// **What it does**: compiles the spec into an analytical query
    /// (universe → features → filters → ordering), executes it, normalizes
    /// the rows, and caches the result for 24h.
    /// **Output**: instance count and date range; pass `return_results` for
    /// the full rows.
    /// **Next tools**: `calculate_backtest_statistic`, `generate_backtest_table`.
    #[tool(name = "run_backtest", annotations(read_only_hint = true))]
    async fn run_backtest(
        &self,
        Parameters(params): Parameters<RunBacktestParams>,
    ) -> Result<Json<BacktestRunResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::backtest::execute(&self.ctx, params.strategy_id, params.return_results)
            .await
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Compute a scalar statistic over a column of the cached backtest result.
    ///
    /// **Prerequisites**: `run_backtest` must have produced a cached result
    /// (results live 24h).
    /// **Calculations**: average, sum, min, max, count. Missing and
    /// non-finite values are skipped.
    #[tool(name = "calculate_backtest_statistic", annotations(read_only_hint = true))]
    async fn calculate_backtest_statistic(
        &self,
        Parameters(params): Parameters<CalculateStatisticParams>,
    ) -> Result<Json<StatisticResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::statistic::execute(
            &self.ctx,
            params.strategy_id,
            &params.column_name,
            &params.calculation_type,
        )
        .map(Json)
        .map_err(|e| format!("Error: {e}"))
    }

    /// Render the cached backtest result as a table.
    ///
    /// **Prerequisites**: `run_backtest` must have produced a cached result.
    /// A synthetic `instance` column ($$$$TICKER-MILLIS$$$$) is always
    /// prepended; `ticker` and `timestamp` are folded into it. Null cells
    /// render as "N/A", floats to two decimals unless `column_format` says
    /// otherwise.
    #[tool(name = "generate_backtest_table", annotations(read_only_hint = true))]
    async fn generate_backtest_table(
        &self,
        Parameters(params): Parameters<GenerateTableParams>,
    ) -> Result<Json<TableResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::table::execute(
            &self.ctx,
            params.strategy_id,
            &params.columns,
            params.column_mapping.as_ref(),
            params.column_format.as_ref(),
        )
        .map(Json)
        .map_err(|e| format!("Error: {e}"))
    }

    /// List the caller's stored strategies.
    #[tool(name = "get_strategies", annotations(read_only_hint = true))]
    async fn get_strategies(&self) -> Result<Json<StrategiesResponse>, String> {
        tools::strategy::list(&self.ctx)
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Fetch one strategy's full specification (name-form universe filters).
    #[tool(name = "get_strategy_spec", annotations(read_only_hint = true))]
    async fn get_strategy_spec(
        &self,
        Parameters(params): Parameters<GetStrategySpecParams>,
    ) -> Result<Json<StrategySpecResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::strategy::get_spec(&self.ctx, params.strategy_id)
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Store a hand-written strategy specification.
    ///
    /// The spec is validated exactly like synthesized ones; diagnostics come
    /// back as a `; `-joined, path-ordered list.
    #[tool(name = "new_strategy", annotations(destructive_hint = false, idempotent_hint = false))]
    async fn new_strategy(
        &self,
        Parameters(params): Parameters<NewStrategyParams>,
    ) -> Result<Json<StrategyIdResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::strategy::create(&self.ctx, &params.name, &params.spec)
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Update a strategy's name and/or spec, and/or toggle its alert flag.
    #[tool(name = "set_strategy", annotations(destructive_hint = true, idempotent_hint = false))]
    async fn set_strategy(
        &self,
        Parameters(params): Parameters<SetStrategyParams>,
    ) -> Result<Json<AckResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::strategy::update(
            &self.ctx,
            params.strategy_id,
            params.name.as_deref(),
            params.spec.as_ref(),
            params.alert_active,
        )
        .map(Json)
        .map_err(|e| format!("Error: {e}"))
    }

    /// Delete a strategy and its cached results.
    #[tool(name = "delete_strategy", annotations(destructive_hint = true, idempotent_hint = true))]
    async fn delete_strategy(
        &self,
        Parameters(params): Parameters<DeleteStrategyParams>,
    ) -> Result<Json<AckResponse>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        tools::strategy::delete(&self.ctx, params.strategy_id)
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for ScreenerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "screener-mcp".into(),
                title: Some("Screener Strategy Backtesting Engine".into()),
                version: "0.1.0".into(),
                description: Some(
                    "Natural-language stock screening: strategy synthesis with \
                     self-repair, windowed/ranked feature compilation, backtest \
                     execution with cached derivations, and near-real-time alerts"
                        .into(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Stock screening and strategy backtesting engine. \
                \n\nRecommended workflow:\
                \n1. create_strategy_from_prompt({ query }) — describe the strategy in \
                plain language; the engine synthesizes and validates a declarative \
                spec (universe, features, filters, ordering) and stores it. Pass \
                strategy_id to rewrite an existing strategy instead.\
                \n2. run_backtest({ strategy_id, return_results? }) — compile the spec \
                into an analytical query over the historical OHLCV/fundamental data \
                and execute it. Returns the instance count and date range; results \
                are cached for 24 hours.\
                \n3. calculate_backtest_statistic({ strategy_id, column_name, \
                calculation_type }) — average/sum/min/max/count over any result \
                column, served from the cache.\
                \n4. generate_backtest_table({ strategy_id, columns, column_mapping?, \
                column_format? }) — render cached results as a table keyed by \
                $$$$TICKER-MILLIS$$$$ instance tokens.\
                \n5. set_strategy({ strategy_id, alert_active: true }) — enable the \
                alert scheduler for the strategy; new instances are dispatched to \
                the configured transports as they appear.\
                \nget_strategies / get_strategy_spec / new_strategy / delete_strategy \
                round out plain CRUD.\
                \n\nData flow summary: NL query → synthesizer (self-repair loop) → \
                validated spec → store (sector/industry names ↔ ids) → query compiler \
                (universe view → RPN features with lags, smoothing windows, ranks → \
                filters → ordering) → backtest runner → normalized instances → result \
                cache → statistics and tables."
                    .into(),
            ),
        }
    }
}
