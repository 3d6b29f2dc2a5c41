//! End-to-end strategy pipeline scenarios: synthesis, compilation,
//! backtest execution, cached derivations, and alert evaluation over a
//! synthetic daily market.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use screener_mcp::alerts::transport::{AlertMessage, AlertTransport};
use screener_mcp::alerts::{AlertScheduler, Evaluator};
use screener_mcp::derive::{self, Calculation};
use screener_mcp::error::{PipelineError, Result};
use screener_mcp::spec::Filter;
use screener_mcp::tools;

mod common;
use common::{
    day_ms, gap_spec, make_context, sector_outperformer_spec, GAP_RESPONSE,
    GAP_RESPONSE_NO_TIMEFRAME,
};

// ─── Scenario: gap-up detection ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gap_up_backtest_finds_both_gap_days() {
    let (ctx, _model, _tmp) = make_context(vec![]);
    let id = ctx.store.create(1, "gap up", &gap_spec(), &ctx.vocab).unwrap();

    let result = ctx
        .runner
        .run(1, id, &gap_spec(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.summary.count, 2);
    let range = result.summary.date_range.as_ref().unwrap();
    assert_eq!(range.min_ms, day_ms(3));
    assert_eq!(range.max_ms, day_ms(6));
    assert!(range.min_iso.starts_with("2024-01-03"));

    for instance in &result.instances {
        assert_eq!(instance["ticker"], serde_json::json!("GLD"));
        assert_eq!(instance["securityId"], serde_json::json!(3));
        let gap = instance["gap"].as_f64().unwrap();
        assert!(gap > 0.03, "gap {gap} should exceed 0.03");
    }
    let gaps: Vec<f64> = result
        .instances
        .iter()
        .map(|i| i["gap"].as_f64().unwrap())
        .collect();
    assert!((gaps[0] - 0.04).abs() < 1e-9);
    assert!((gaps[1] - 0.035).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_statistic_matches_arithmetic_mean() {
    let (ctx, _model, _tmp) = make_context(vec![]);
    let id = ctx.store.create(1, "gap up", &gap_spec(), &ctx.vocab).unwrap();
    ctx.runner
        .run(1, id, &gap_spec(), &CancellationToken::new())
        .await
        .unwrap();
    // The cache write is detached; give it a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let avg = derive::calculate(&ctx.cache, 1, id, "gap", Calculation::Average).unwrap();
    assert!((avg - (0.04 + 0.035) / 2.0).abs() < 1e-9);

    let count = derive::calculate(&ctx.cache, 1, id, "gap", Calculation::Count).unwrap();
    assert!((count - 2.0).abs() < f64::EPSILON);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_result_yields_zero_count_and_value_error() {
    let (ctx, _model, _tmp) = make_context(vec![]);
    // Impossible threshold: no instance ever gaps 1000%.
    let mut spec = gap_spec();
    spec.filters = vec![Filter {
        name: "impossible".to_string(),
        feature_id: 0,
        operator: ">".to_string(),
        constant: Some(10.0),
        ..Filter::default()
    }];
    let id = ctx.store.create(1, "never", &spec, &ctx.vocab).unwrap();

    let result = ctx
        .runner
        .run(1, id, &spec, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.summary.count, 0);
    assert!(result.instances.is_empty());
    assert!(result.summary.date_range.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let count = derive::calculate(&ctx.cache, 1, id, "gap", Calculation::Count).unwrap();
    assert!(count.abs() < f64::EPSILON);
    let err = derive::calculate(&ctx.cache, 1, id, "gap", Calculation::Average).unwrap_err();
    assert!(matches!(err, PipelineError::Value(_)));
}

// ─── Scenario: sector outperformer ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sector_outperformer_selects_only_the_rising_name() {
    let (ctx, _model, _tmp) = make_context(vec![]);
    let spec = sector_outperformer_spec();
    let id = ctx.store.create(1, "outperformers", &spec, &ctx.vocab).unwrap();

    let result = ctx
        .runner
        .run(1, id, &spec, &CancellationToken::new())
        .await
        .unwrap();

    // AAA (+10%/day) beats 1.05 × sector mean on all seven days with a
    // defined change; BBB (−5%/day) never does.
    assert_eq!(result.summary.count, 7);
    assert!(result.summary.date_range.is_some());
    for instance in &result.instances {
        assert_eq!(instance["ticker"], serde_json::json!("AAA"));
        assert!(instance["chg"].as_f64().unwrap() > instance["sector_chg"].as_f64().unwrap());
    }
}

// ─── Scenario: synthesis repair loop through the tool surface ────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_from_prompt_repairs_and_runs_end_to_end() {
    let (ctx, model, _tmp) = make_context(vec![GAP_RESPONSE_NO_TIMEFRAME, GAP_RESPONSE]);

    let created = tools::strategy::create_from_prompt(
        &ctx,
        "gold gapped up over 3% over the last year",
        None,
    )
    .await
    .unwrap();
    assert_eq!(created.name, "GLD gap up");

    // The second model call carries the validation diagnostic as a user turn.
    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let repair_turn = requests[1].last().unwrap();
    assert_eq!(repair_turn.role, "user");
    assert!(repair_turn.content.contains("universe.timeframe"));
    drop(requests);

    // The persisted spec is valid and runnable; ticker filters carry no ids.
    let stored = tools::strategy::get_spec(&ctx, created.strategy_id).unwrap();
    assert_eq!(stored.spec.universe.timeframe, "1d");

    let run = tools::backtest::execute(&ctx, created.strategy_id, true)
        .await
        .unwrap();
    assert_eq!(run.count, 2);
    assert_eq!(run.instances.as_ref().unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stat = tools::statistic::execute(&ctx, created.strategy_id, "gap", "average").unwrap();
    assert!((stat.value - 0.0375).abs() < 1e-9);

    let table = tools::table::execute(
        &ctx,
        created.strategy_id,
        &["gap".to_string()],
        None,
        None,
    )
    .unwrap();
    assert_eq!(table.content.headers, vec!["instance", "gap"]);
    assert_eq!(
        table.content.rows[0][0],
        format!("$$$$GLD-{}$$$$", day_ms(3))
    );
}

// ─── Scenario: alert evaluation over the real runner ─────────────────────────

struct CollectingTransport {
    sent: std::sync::Mutex<Vec<AlertMessage>>,
}

#[async_trait]
impl AlertTransport for CollectingTransport {
    fn name(&self) -> &'static str {
        "collecting"
    }

    async fn send(&self, alert: &AlertMessage) -> Result<()> {
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alert_scheduler_fires_once_per_instance_across_ticks() {
    let (ctx, _model, _tmp) = make_context(vec![]);
    let id = ctx.store.create(1, "gap up", &gap_spec(), &ctx.vocab).unwrap();
    ctx.store.set_alert_active(1, id, true).unwrap();

    let transport = Arc::new(CollectingTransport {
        sent: std::sync::Mutex::new(Vec::new()),
    });
    let cancel = CancellationToken::new();
    let scheduler = AlertScheduler::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.vocab),
        Arc::clone(&ctx.runner) as Arc<dyn Evaluator>,
        vec![Arc::clone(&transport) as Arc<dyn AlertTransport>],
        Duration::from_millis(20),
        cancel.clone(),
    );
    let handle = scheduler.spawn();

    // Several ticks elapse; the firing set keeps re-evaluations silent.
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    handle.await.unwrap();

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 2, "each gap instance alerts exactly once");
    let mut keys: Vec<String> = sent.iter().map(|a| a.instance_key.clone()).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            format!("$$$$GLD-{}$$$$", day_ms(3)),
            format!("$$$$GLD-{}$$$$", day_ms(6)),
        ]
    );
    assert!(sent.iter().all(|a| a.ticker == "GLD"));
    drop(sent);

    let firings = ctx.store.firing_keys(id).unwrap();
    assert_eq!(firings.len(), 2);
}
