//! Derivation engine: scalar aggregates and projected tables computed from
//! cached backtest results, without re-running the query.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backtest::{millis_to_iso, TIMESTAMP_FIELD};
use crate::cache::TtlCache;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calculation {
    Average,
    Sum,
    Min,
    Max,
    Count,
}

impl Calculation {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw.to_lowercase().as_str() {
            "average" | "avg" | "mean" => Calculation::Average,
            "sum" => Calculation::Sum,
            "min" => Calculation::Min,
            "max" => Calculation::Max,
            "count" => Calculation::Count,
            other => {
                return Err(PipelineError::Value(format!(
                    "unknown calculation type {other:?}"
                )))
            }
        })
    }
}

/// Scalar aggregate over one column of the cached result.
///
/// Values that are missing or not finite numbers are skipped. `count`
/// counts the instances that carry the column (0 for an empty result);
/// everything else needs at least one valid value.
pub fn calculate(
    cache: &TtlCache,
    user_id: i64,
    strategy_id: i64,
    column: &str,
    kind: Calculation,
) -> Result<f64> {
    let result = cache.load_result(user_id, strategy_id)?;
    let values: Vec<f64> = result
        .instances
        .iter()
        .filter_map(|instance| instance.get(column))
        .filter_map(Value::as_f64)
        .filter(|v| v.is_finite())
        .collect();

    if kind == Calculation::Count {
        return Ok(values.len() as f64);
    }
    if values.is_empty() {
        return Err(PipelineError::Value(format!(
            "no valid values for column {column:?}"
        )));
    }

    Ok(match kind {
        Calculation::Average => values.iter().sum::<f64>() / values.len() as f64,
        Calculation::Sum => values.iter().sum(),
        // First value seeds; strict comparison keeps first-occurrence ties.
        Calculation::Min => values.iter().skip(1).fold(values[0], |acc, v| {
            if *v < acc {
                *v
            } else {
                acc
            }
        }),
        Calculation::Max => values.iter().skip(1).fold(values[0], |acc, v| {
            if *v > acc {
                *v
            } else {
                acc
            }
        }),
        Calculation::Count => unreachable!(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: TableContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TableContent {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub strategy_id: i64,
    pub internal_column_names: Vec<String>,
}

/// Project the cached result into a rendered table.
///
/// A synthetic `instance` column always comes first, rendered as
/// `$$$${TICKER}-{MILLIS}$$$$`; `ticker` and `timestamp` are subsumed by it
/// and dropped from the caller's column list.
pub fn project(
    cache: &TtlCache,
    user_id: i64,
    strategy_id: i64,
    columns: &[String],
    column_mapping: Option<&HashMap<String, String>>,
    column_format: Option<&HashMap<String, String>>,
) -> Result<TableResponse> {
    let result = cache.load_result(user_id, strategy_id)?;

    let selected: Vec<&String> = columns
        .iter()
        .filter(|c| c.as_str() != "ticker" && c.as_str() != TIMESTAMP_FIELD)
        .collect();

    let mut headers = vec!["instance".to_string()];
    let mut internal = vec!["instance".to_string()];
    for column in &selected {
        let header = column_mapping
            .and_then(|m| m.get(column.as_str()))
            .map_or(column.as_str(), String::as_str);
        headers.push(header.to_string());
        internal.push((*column).clone());
    }

    let mut rows = Vec::with_capacity(result.instances.len());
    for instance in &result.instances {
        let mut row = Vec::with_capacity(selected.len() + 1);
        row.push(instance_token(instance));
        for column in &selected {
            let format = column_format
                .and_then(|m| m.get(column.as_str()))
                .map(String::as_str);
            row.push(render_cell(column, instance.get(column.as_str()), format));
        }
        rows.push(row);
    }

    Ok(TableResponse {
        kind: "table".to_string(),
        content: TableContent {
            headers,
            rows,
            strategy_id,
            internal_column_names: internal,
        },
    })
}

/// Stable instance token: four dollar signs, uppercase ticker, hyphen,
/// integer milliseconds, four dollar signs.
pub fn instance_token(instance: &Map<String, Value>) -> String {
    let ticker = instance
        .get("ticker")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_uppercase();
    let millis = instance
        .get(TIMESTAMP_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0);
    format!("$$$${ticker}-{millis}$$$$")
}

fn render_cell(column: &str, value: Option<&Value>, format: Option<&str>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::Number(n)) => {
            if column == TIMESTAMP_FIELD {
                n.as_i64().map_or_else(|| n.to_string(), millis_to_iso)
            } else if n.is_f64() {
                format_float(n.as_f64().unwrap_or_default(), format)
            } else {
                n.to_string()
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Apply a `%.Nf`-style format string; anything else falls back to two
/// decimals.
fn format_float(value: f64, format: Option<&str>) -> String {
    if let Some(spec) = format {
        if let Some(precision) = parse_float_precision(spec) {
            return format!("{value:.precision$}");
        }
    }
    format!("{value:.2}")
}

fn parse_float_precision(spec: &str) -> Option<usize> {
    let body = spec.strip_prefix("%.")?;
    let digits = body.strip_suffix('f')?;
    digits.parse().ok()
}
