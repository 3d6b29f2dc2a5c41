#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tempfile::TempDir;

use screener_mcp::backtest::BacktestRunner;
use screener_mcp::cache::TtlCache;
use screener_mcp::context::AppContext;
use screener_mcp::error::{PipelineError, Result};
use screener_mcp::market::MarketStore;
use screener_mcp::spec::{ExprPart, Feature, Filter, Source, StrategySpec, Universe, UniverseFilter};
use screener_mcp::store::StrategyStore;
use screener_mcp::synth::llm::{ChatMessage, ChatModel};
use screener_mcp::synth::Synthesizer;
use screener_mcp::vocab::{self, Vocabulary};

pub fn day(d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

pub fn day_ms(d: u32) -> i64 {
    day(d).and_utc().timestamp_millis()
}

fn write_parquet(dir: &Path, file: &str, df: &mut DataFrame) {
    let handle = std::fs::File::create(dir.join(file)).unwrap();
    ParquetWriter::new(handle).finish(df).unwrap();
}

/// Synthetic daily market: two Technology names and one gold ETF over
/// eight sessions.
///
/// GLD closes at a flat 100 while its opens gap: day 3 opens 4% above the
/// prior close and day 6 opens 3.5% above it, so `open/close[-1] - 1 > 0.03`
/// fires exactly twice.
///
/// AAA rises ~10% a day while BBB falls ~5%, so AAA beats the Technology
/// sector-mean change on every day with a defined change and BBB never does.
pub fn seed_market(dir: &Path) {
    let days: Vec<NaiveDateTime> = (1..=8).map(day).collect();

    // (security_id, closes, opens)
    let series: [(i64, [f64; 8], [f64; 8]); 3] = [
        (
            1, // AAA
            [100.0, 110.0, 121.0, 133.0, 146.0, 161.0, 177.0, 195.0],
            [100.0, 109.0, 120.0, 132.0, 145.0, 160.0, 176.0, 194.0],
        ),
        (
            2, // BBB
            [200.0, 190.0, 180.0, 171.0, 162.0, 154.0, 146.0, 139.0],
            [200.0, 191.0, 181.0, 172.0, 163.0, 155.0, 147.0, 140.0],
        ),
        (
            3, // GLD: flat closes, gapping opens on days 3 and 6
            [100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0],
            [100.0, 100.5, 104.0, 100.2, 99.8, 103.5, 100.9, 101.0],
        ),
    ];

    let mut sid = Vec::new();
    let mut ts = Vec::new();
    let mut open = Vec::new();
    let mut close = Vec::new();
    for (id, closes, opens) in &series {
        for i in 0..8 {
            sid.push(*id);
            ts.push(days[i]);
            open.push(opens[i]);
            close.push(closes[i]);
        }
    }
    let n = sid.len();
    let mut bars = df! {
        "security_id" => &sid,
        "timestamp" => &ts,
        "open" => &open,
        "high" => vec![1_000.0f64; n],
        "low" => vec![0.0f64; n],
        "close" => &close,
        "volume" => vec![10_000.0f64; n],
    }
    .unwrap();
    write_parquet(dir, "ohlcv_1d.parquet", &mut bars);

    let mut securities = df! {
        "security_id" => &[1i64, 2, 3],
        "ticker" => &["AAA", "BBB", "GLD"],
        "sector" => &["Technology", "Technology", "Commodities"],
        "industry" => &["Software", "Hardware", "Gold"],
        "market" => &["stocks", "stocks", "stocks"],
        "locale" => &["us", "us", "us"],
        "exchange" => &["XNAS", "XNAS", "ARCA"],
        "active" => &[true, true, true],
    }
    .unwrap();
    write_parquet(dir, "securities.parquet", &mut securities);

    let mut fundamentals = df! {
        "security_id" => &[1i64, 2, 3],
        "market_cap" => &[3.0e12f64, 8.0e11, 5.0e10],
        "pe_ratio" => &[31.0f64, 18.5, 0.0],
    }
    .unwrap();
    write_parquet(dir, "fundamentals.parquet", &mut fundamentals);
}

/// Scenario spec: GLD gapped up over 3% (`open/close[-1] - 1 > 0.03`).
pub fn gap_spec() -> StrategySpec {
    StrategySpec {
        universe: Universe {
            timeframe: "1d".to_string(),
            filters: vec![UniverseFilter {
                attribute: "ticker".to_string(),
                include: vec!["GLD".to_string()],
                ..UniverseFilter::default()
            }],
            ..Universe::default()
        },
        features: vec![Feature {
            name: "gap".to_string(),
            feature_id: 0,
            source: Source::default(),
            output: "raw".to_string(),
            expr: vec![
                ExprPart::column("open"),
                ExprPart::lagged("close", 1),
                ExprPart::operator("/"),
                ExprPart::column("1"),
                ExprPart::operator("-"),
            ],
            window: 1,
        }],
        filters: vec![Filter {
            name: "gap_big".to_string(),
            feature_id: 0,
            operator: ">".to_string(),
            constant: Some(0.03),
            ..Filter::default()
        }],
        sort_by: None,
    }
}

/// Scenario spec: Technology stocks whose daily change beats the sector
/// average change by 5% (`f0 > f1 * 1.05`).
pub fn sector_outperformer_spec() -> StrategySpec {
    let change_expr = vec![
        ExprPart::column("close"),
        ExprPart::lagged("close", 1),
        ExprPart::operator("/"),
        ExprPart::column("1"),
        ExprPart::operator("-"),
    ];
    StrategySpec {
        universe: Universe {
            timeframe: "1d".to_string(),
            filters: vec![UniverseFilter {
                attribute: "sector".to_string(),
                include: vec!["Technology".to_string()],
                ..UniverseFilter::default()
            }],
            ..Universe::default()
        },
        features: vec![
            Feature {
                name: "chg".to_string(),
                feature_id: 0,
                source: Source::default(),
                output: "raw".to_string(),
                expr: change_expr.clone(),
                window: 1,
            },
            Feature {
                name: "sector_chg".to_string(),
                feature_id: 1,
                source: Source {
                    field: "sector".to_string(),
                    value: "relative".to_string(),
                },
                output: "raw".to_string(),
                expr: change_expr,
                window: 1,
            },
        ],
        filters: vec![Filter {
            name: "outperformer".to_string(),
            feature_id: 0,
            operator: ">".to_string(),
            rhs_feature_id: Some(1),
            scale: Some(1.05),
            ..Filter::default()
        }],
        sort_by: None,
    }
}

/// Scripted chat model: canned responses in order, requests recorded.
pub struct ScriptedModel {
    responses: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<&str>) -> Self {
        let mut responses: Vec<String> = responses.into_iter().map(String::from).collect();
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| PipelineError::Transport("script exhausted".to_string()))
    }
}

/// Full application context over a seeded tempdir market, an in-memory
/// strategy store, and a scripted model.
pub fn make_context(responses: Vec<&str>) -> (Arc<AppContext>, Arc<ScriptedModel>, TempDir) {
    let tmp = TempDir::new().unwrap();
    seed_market(tmp.path());

    let market = Arc::new(MarketStore::new(tmp.path()));
    let store = Arc::new(StrategyStore::open_in_memory().unwrap());
    let vocab = Arc::new(Vocabulary::new());
    vocab::init(
        &vocab,
        store.list_sectors(),
        store.list_industries(),
        market.fundamental_columns(),
    )
    .unwrap();

    let cache = Arc::new(TtlCache::default());
    let model = Arc::new(ScriptedModel::new(responses));
    let synth = Arc::new(Synthesizer::new(
        Arc::clone(&model) as Arc<dyn ChatModel>,
        Arc::clone(&vocab),
        Arc::clone(&store),
        Arc::clone(&cache),
        3,
    ));
    let runner = Arc::new(BacktestRunner::new(Arc::clone(&market), Arc::clone(&cache)));

    let ctx = Arc::new(AppContext {
        vocab,
        store,
        market,
        cache,
        runner,
        synth,
        user_id: 1,
    });
    (ctx, model, tmp)
}

/// A model response the synthesizer accepts: the GLD gap-up strategy.
pub const GAP_RESPONSE: &str = r#"{
    "name": "GLD gap up",
    "spec": {
        "universe": {
            "timeframe": "1d",
            "filters": [{"attribute": "ticker", "include": ["GLD"], "exclude": []}]
        },
        "features": [{
            "name": "gap", "featureId": 0,
            "source": {"field": "ticker", "value": "relative"},
            "output": "raw",
            "expr": [
                {"column": "open"},
                {"column": "close", "offset": 1},
                {"operator": "/"},
                {"column": "1"},
                {"operator": "-"}
            ],
            "window": 1
        }],
        "filters": [{"name": "gap_big", "featureId": 0, "operator": ">", "constant": 0.03}]
    }
}"#;

/// The same strategy with the timeframe missing; fails validation and
/// drives the repair loop.
pub const GAP_RESPONSE_NO_TIMEFRAME: &str = r#"{
    "name": "GLD gap up",
    "spec": {
        "universe": {
            "filters": [{"attribute": "ticker", "include": ["GLD"], "exclude": []}]
        },
        "features": [{
            "name": "gap", "featureId": 0,
            "expr": [
                {"column": "open"},
                {"column": "close", "offset": 1},
                {"operator": "/"},
                {"column": "1"},
                {"operator": "-"}
            ]
        }],
        "filters": [{"name": "gap_big", "featureId": 0, "operator": ">", "constant": 0.03}]
    }
}"#;
