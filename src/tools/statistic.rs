//! `calculate_backtest_statistic` executor.

use crate::context::AppContext;
use crate::derive::{self, Calculation};
use crate::error::Result;
use crate::tools::response_types::StatisticResponse;

pub fn execute(
    ctx: &AppContext,
    strategy_id: i64,
    column: &str,
    calculation: &str,
) -> Result<StatisticResponse> {
    let kind = Calculation::parse(calculation)?;
    let value = derive::calculate(&ctx.cache, ctx.user_id, strategy_id, column, kind)?;
    Ok(StatisticResponse {
        summary: format!("{calculation} of {column} = {value}"),
        strategy_id,
        column: column.to_string(),
        calculation: calculation.to_string(),
        value,
    })
}
