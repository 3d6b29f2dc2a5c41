//! `run_backtest` executor.

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::error::Result;
use crate::tools::response_types::BacktestRunResponse;

pub async fn execute(
    ctx: &AppContext,
    strategy_id: i64,
    return_results: bool,
) -> Result<BacktestRunResponse> {
    let strategy = ctx.store.get(ctx.user_id, strategy_id, &ctx.vocab)?;
    let cancel = CancellationToken::new();
    let result = ctx
        .runner
        .run(ctx.user_id, strategy_id, &strategy.spec, &cancel)
        .await?;

    let range_text = result.summary.date_range.as_ref().map_or_else(
        || "no matching instances".to_string(),
        |r| format!("{} to {}", r.min_iso, r.max_iso),
    );
    Ok(BacktestRunResponse {
        summary: format!(
            "Backtest of '{}' found {} instances ({range_text}).",
            strategy.name, result.summary.count
        ),
        strategy_id,
        count: result.summary.count,
        date_range: result.summary.date_range.clone(),
        instances: return_results.then_some(result.instances),
        suggested_next_steps: vec![
            format!(
                "calculate_backtest_statistic({{ strategy_id: {strategy_id}, column_name, calculation_type }}) for aggregates"
            ),
            format!(
                "generate_backtest_table({{ strategy_id: {strategy_id}, columns: [...] }}) for a rendered table"
            ),
        ],
    })
}
