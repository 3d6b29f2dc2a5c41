//! `generate_backtest_table` executor.

use std::collections::HashMap;

use crate::context::AppContext;
use crate::derive::{self, TableResponse};
use crate::error::Result;

pub fn execute(
    ctx: &AppContext,
    strategy_id: i64,
    columns: &[String],
    column_mapping: Option<&HashMap<String, String>>,
    column_format: Option<&HashMap<String, String>>,
) -> Result<TableResponse> {
    derive::project(
        &ctx.cache,
        ctx.user_id,
        strategy_id,
        columns,
        column_mapping,
        column_format,
    )
}
