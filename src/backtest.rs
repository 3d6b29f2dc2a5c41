//! Backtest execution: compile the spec, run the query, normalize rows into
//! the wire shape, summarize, and hand the result to the cache.
//!
//! The normalizer is the single numeric chokepoint: whatever the storage
//! engine produced (native timestamps, RFC3339 strings, arbitrary-precision
//! `{Exp, Int}` decimals), downstream code only ever sees plain JSON
//! numbers and millisecond epochs.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use polars::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::compile;
use crate::error::{PipelineError, Result};
use crate::market::MarketStore;
use crate::spec::StrategySpec;

pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const SECURITY_ID_FIELD: &str = "securityId";

/// One backtest outcome: matching instances plus a scan summary.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct BacktestResult {
    pub instances: Vec<Map<String, Value>>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Summary {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DateRange {
    pub min_ms: i64,
    pub max_ms: i64,
    pub min_iso: String,
    pub max_iso: String,
}

pub struct BacktestRunner {
    market: Arc<MarketStore>,
    cache: Arc<TtlCache>,
}

impl BacktestRunner {
    pub fn new(market: Arc<MarketStore>, cache: Arc<TtlCache>) -> Self {
        Self { market, cache }
    }

    /// Compile and execute a strategy, returning the normalized result.
    ///
    /// The cache write is detached: the caller's reply never waits on it.
    pub async fn run(
        &self,
        user_id: i64,
        strategy_id: i64,
        spec: &StrategySpec,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let compiled = compile::compile(spec, &self.market)?;
        let plan = compiled.plan;
        let df = compiled.frame.collect().map_err(|e| {
            tracing::error!(%strategy_id, error = %e, plan = %plan, "backtest query failed");
            PipelineError::Query {
                message: e.to_string(),
                plan,
            }
        })?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let feature_names: FxHashMap<String, String> = spec
            .features
            .iter()
            .map(|f| (format!("f{}", f.feature_id), f.name.clone()))
            .collect();

        let instances: Vec<Map<String, Value>> = scan_rows(&df)?
            .into_iter()
            .map(|row| normalize_row(row, &feature_names))
            .collect();
        let summary = summarize(&instances);
        let result = BacktestResult { instances, summary };

        let cache = Arc::clone(&self.cache);
        let key = TtlCache::backtest_key(user_id, strategy_id);
        let payload = serde_json::to_string(&result)
            .map_err(|e| PipelineError::Transport(format!("result serialization: {e}")))?;
        tokio::spawn(async move {
            cache.put_default_ttl(&key, payload);
            tracing::debug!(%key, "backtest result cached");
        });

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Row scanning
// ---------------------------------------------------------------------------

/// Scan result rows into ordered column-name → value maps, preserving the
/// field order of the query projection.
fn scan_rows(df: &DataFrame) -> Result<Vec<Map<String, Value>>> {
    let columns = df.columns();
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let mut row = Map::with_capacity(columns.len());
        for column in columns {
            let value = column.get(i).map_err(|e| PipelineError::Query {
                message: format!("row scan: {e}"),
                plan: String::new(),
            })?;
            row.insert(column.name().to_string(), any_value_to_json(&value));
        }
        rows.push(row);
    }
    Ok(rows)
}

fn any_value_to_json(value: &AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(*b),
        AnyValue::Int8(v) => Value::from(i64::from(*v)),
        AnyValue::Int16(v) => Value::from(i64::from(*v)),
        AnyValue::Int32(v) => Value::from(i64::from(*v)),
        AnyValue::Int64(v) => Value::from(*v),
        AnyValue::UInt8(v) => Value::from(u64::from(*v)),
        AnyValue::UInt16(v) => Value::from(u64::from(*v)),
        AnyValue::UInt32(v) => Value::from(u64::from(*v)),
        AnyValue::UInt64(v) => Value::from(*v),
        AnyValue::Float32(v) => float_json(f64::from(*v)),
        AnyValue::Float64(v) => float_json(*v),
        AnyValue::String(s) => Value::from(*s),
        AnyValue::StringOwned(s) => Value::from(s.to_string()),
        AnyValue::Datetime(v, unit, _) => Value::from(to_millis(*v, *unit)),
        AnyValue::DatetimeOwned(v, unit, _) => Value::from(to_millis(*v, *unit)),
        AnyValue::Date(days) => Value::from(i64::from(*days) * 86_400_000),
        other => Value::String(format!("{other}")),
    }
}

fn float_json(v: f64) -> Value {
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn to_millis(v: i64, unit: TimeUnit) -> i64 {
    match unit {
        TimeUnit::Milliseconds => v,
        TimeUnit::Microseconds => v / 1_000,
        TimeUnit::Nanoseconds => v / 1_000_000,
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize one scanned row: rename `securityid`/`security_id` to
/// `securityId`, convert the timestamp to epoch milliseconds, flatten
/// decimal-encoded numerics, rename `f{id}` columns to declared feature
/// names. Field order is preserved.
pub fn normalize_row(
    row: Map<String, Value>,
    feature_names: &FxHashMap<String, String>,
) -> Map<String, Value> {
    let mut out = Map::with_capacity(row.len());
    for (key, value) in row {
        let key = if key == "securityid" || key == "security_id" {
            SECURITY_ID_FIELD.to_string()
        } else if let Some(declared) = feature_names.get(&key) {
            declared.clone()
        } else {
            key
        };
        let value = if key == TIMESTAMP_FIELD {
            normalize_timestamp(value)
        } else {
            normalize_numeric(value)
        };
        out.insert(key, value);
    }
    out
}

/// Timestamp → epoch milliseconds. Native datetimes were already converted
/// at scan time; RFC3339 strings are parsed; numerics pass through as ms.
/// Anything unrecognized falls through literally.
fn normalize_timestamp(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                Value::from(ms)
            } else if let Some(f) = n.as_f64() {
                Value::from(f as i64)
            } else {
                Value::Number(n)
            }
        }
        Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::from(dt.timestamp_millis()),
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

/// Flatten `{Exp, Int}` arbitrary-precision decimals into floats. A value
/// that isn't itself decimal-shaped gets one more pass over its members so
/// nested numerics that survived the first pass are caught.
fn normalize_numeric(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(flat) = decimal_to_float(&map) {
                return flat;
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::Object(inner) => {
                                decimal_to_float(&inner).unwrap_or(Value::Object(inner))
                            }
                            other => other,
                        };
                        (k, v)
                    })
                    .collect(),
            )
        }
        other => other,
    }
}

/// `{Exp, Int}` → `Int * 10^Exp` as a float, when the object has exactly
/// that shape. `Int` may arrive as a number or an integer-like string.
fn decimal_to_float(map: &Map<String, Value>) -> Option<Value> {
    if map.len() != 2 {
        return None;
    }
    let exp = map.get("Exp")?.as_i64()?;
    let int = match map.get("Int")? {
        Value::Number(n) => n.as_i64().map(|v| v as f64).or_else(|| n.as_f64())?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    Some(float_json(int * 10f64.powi(exp as i32)))
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Count plus a full-scan date range; rows are not guaranteed sorted by
/// time, so min/max cannot come from the first and last instance.
pub fn summarize(instances: &[Map<String, Value>]) -> Summary {
    let mut min_ms: Option<i64> = None;
    let mut max_ms: Option<i64> = None;
    for instance in instances {
        if let Some(ms) = instance.get(TIMESTAMP_FIELD).and_then(Value::as_i64) {
            min_ms = Some(min_ms.map_or(ms, |m| m.min(ms)));
            max_ms = Some(max_ms.map_or(ms, |m| m.max(ms)));
        }
    }
    let date_range = match (min_ms, max_ms) {
        (Some(min), Some(max)) => Some(DateRange {
            min_ms: min,
            max_ms: max,
            min_iso: millis_to_iso(min),
            max_iso: millis_to_iso(max),
        }),
        _ => None,
    };
    Summary {
        count: instances.len(),
        date_range,
    }
}

pub fn millis_to_iso(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map_or_else(|| ms.to_string(), |dt| dt.to_rfc3339())
}
