//! Strategy lifecycle executors: NL synthesis plus plain CRUD.

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::error::{PipelineError, Result};
use crate::spec::{validate, StrategySpec};
use crate::tools::response_types::{
    AckResponse, CreateStrategyResponse, StrategiesResponse, StrategyIdResponse, StrategyInfo,
    StrategySpecResponse,
};

pub async fn create_from_prompt(
    ctx: &AppContext,
    query: &str,
    overwrite_id: Option<i64>,
) -> Result<CreateStrategyResponse> {
    let cancel = CancellationToken::new();
    let (strategy_id, name) = ctx
        .synth
        .synthesize(ctx.user_id, query, overwrite_id, &cancel)
        .await?;
    Ok(CreateStrategyResponse {
        summary: format!("Created strategy '{name}' (id {strategy_id}) from your description."),
        strategy_id,
        name,
        suggested_next_steps: vec![
            format!("run_backtest({{ strategy_id: {strategy_id} }}) to evaluate it"),
            format!("get_strategy_spec({{ strategy_id: {strategy_id} }}) to inspect the spec"),
        ],
    })
}

pub fn list(ctx: &AppContext) -> Result<StrategiesResponse> {
    let strategies = ctx.store.list(ctx.user_id, &ctx.vocab)?;
    let infos: Vec<StrategyInfo> = strategies
        .iter()
        .map(|s| StrategyInfo {
            strategy_id: s.id,
            name: s.name.clone(),
            version: s.version,
            alert_active: s.alert_active,
            created_at: s.created_at.clone(),
        })
        .collect();
    Ok(StrategiesResponse {
        summary: format!("{} strategies", infos.len()),
        total: infos.len(),
        strategies: infos,
    })
}

pub fn get_spec(ctx: &AppContext, strategy_id: i64) -> Result<StrategySpecResponse> {
    let strategy = ctx.store.get(ctx.user_id, strategy_id, &ctx.vocab)?;
    Ok(StrategySpecResponse {
        strategy_id: strategy.id,
        name: strategy.name,
        spec: strategy.spec,
    })
}

pub fn create(ctx: &AppContext, name: &str, spec: &StrategySpec) -> Result<StrategyIdResponse> {
    validate::validate(spec, &ctx.vocab)
        .map_err(|diags| PipelineError::from_diagnostics(&diags))?;
    let strategy_id = ctx.store.create(ctx.user_id, name, spec, &ctx.vocab)?;
    Ok(StrategyIdResponse {
        summary: format!("Created strategy '{name}' (id {strategy_id})."),
        strategy_id,
    })
}

pub fn update(
    ctx: &AppContext,
    strategy_id: i64,
    name: Option<&str>,
    spec: Option<&StrategySpec>,
    alert_active: Option<bool>,
) -> Result<AckResponse> {
    if let Some(spec) = spec {
        validate::validate(spec, &ctx.vocab)
            .map_err(|diags| PipelineError::from_diagnostics(&diags))?;
    }
    if name.is_some() || spec.is_some() {
        ctx.store
            .update(ctx.user_id, strategy_id, name, spec, &ctx.vocab)?;
    }
    if let Some(active) = alert_active {
        ctx.store.set_alert_active(ctx.user_id, strategy_id, active)?;
    }
    Ok(AckResponse {
        summary: format!("Strategy {strategy_id} updated."),
    })
}

pub fn delete(ctx: &AppContext, strategy_id: i64) -> Result<AckResponse> {
    ctx.store.delete(ctx.user_id, strategy_id)?;
    ctx.cache
        .delete(&crate::cache::TtlCache::backtest_key(ctx.user_id, strategy_id));
    Ok(AckResponse {
        summary: format!("Strategy {strategy_id} deleted."),
    })
}
