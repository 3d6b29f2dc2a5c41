//! Spec → query compiler.
//!
//! Translates a validated [`StrategySpec`] into a polars `LazyFrame` in four
//! stages: universe view, feature columns, filter conjunction, projection
//! and ordering. The validator has already rejected malformed specs; every
//! check here is defense in depth and fails with `CompileFailed` instead of
//! a diagnostic list.

pub mod expr;

use polars::prelude::*;

use crate::error::{PipelineError, Result};
use crate::market::{MarketStore, EXTENDED_HOURS_COL, SECURITY_ID_COL, TICKER_COL, TIMESTAMP_COL};
use crate::spec::validate::parse_time_of_day;
use crate::spec::{Feature, Filter, Source, StrategySpec, Universe, SOURCE_RELATIVE};
use crate::vocab;

/// A runnable query plus a compact plan description for operator logs.
pub struct CompiledQuery {
    pub frame: LazyFrame,
    pub plan: String,
    pub feature_count: usize,
}

impl std::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("plan", &self.plan)
            .field("feature_count", &self.feature_count)
            .finish_non_exhaustive()
    }
}

/// Window partition derived from a feature's source.
enum Partition {
    /// Per-security series: the row's own values.
    Security,
    /// Cross-sectional peer group keyed by the row's own attribute value.
    Attribute(String),
    /// Fixed peer group (`field == value`), broadcast to all rows by
    /// timestamp. Drawn from the full timeframe table so a pinned peer is
    /// visible even when the universe excludes it.
    Pinned { field: String, value: String },
}

pub fn compile(spec: &StrategySpec, market: &MarketStore) -> Result<CompiledQuery> {
    let timeframe = spec.universe.timeframe.as_str();
    if vocab::max_window(timeframe).is_none() {
        return Err(PipelineError::Compile(format!(
            "unknown timeframe {timeframe:?}"
        )));
    }

    let mut plan = vec![format!("universe: ohlcv_{timeframe} ⋈ securities")];

    let mut lf = market.universe(timeframe)?;
    lf = apply_universe(lf, &spec.universe, &mut plan)?;
    lf = lf.sort(
        [SECURITY_ID_COL, TIMESTAMP_COL],
        SortMultipleOptions::default(),
    );

    for feature in &spec.features {
        lf = attach_feature(lf, feature, timeframe, market, &mut plan)?;
    }

    if !spec.filters.is_empty() {
        let mut combined: Option<Expr> = None;
        for filter in &spec.filters {
            let predicate = filter_expr(filter, spec.features.len(), &mut plan)?;
            combined = Some(match combined {
                Some(acc) => acc.and(predicate),
                None => predicate,
            });
        }
        if let Some(predicate) = combined {
            lf = lf.filter(predicate);
        }
    }

    let mut projection = vec![col(TIMESTAMP_COL), col(SECURITY_ID_COL), col(TICKER_COL)];
    for id in 0..spec.features.len() {
        projection.push(col(format!("f{id}")));
    }
    lf = lf.select(projection);

    lf = match &spec.sort_by {
        Some(sort_by) if !sort_by.is_noop() => {
            if sort_by.feature_id >= spec.features.len() {
                return Err(PipelineError::Compile(format!(
                    "sortBy references undefined feature {}",
                    sort_by.feature_id
                )));
            }
            let descending = match sort_by.direction.as_str() {
                "asc" => false,
                "desc" => true,
                other => {
                    return Err(PipelineError::Compile(format!(
                        "unknown sort direction {other:?}"
                    )))
                }
            };
            plan.push(format!(
                "order by: f{} {}",
                sort_by.feature_id, sort_by.direction
            ));
            lf.sort(
                [
                    format!("f{}", sort_by.feature_id),
                    SECURITY_ID_COL.to_string(),
                    TIMESTAMP_COL.to_string(),
                ],
                SortMultipleOptions::default()
                    .with_order_descending_multi([descending, false, false]),
            )
        }
        _ => lf.sort(
            [SECURITY_ID_COL, TIMESTAMP_COL],
            SortMultipleOptions::default(),
        ),
    };

    Ok(CompiledQuery {
        frame: lf,
        plan: plan.join("\n"),
        feature_count: spec.features.len(),
    })
}

// ---------------------------------------------------------------------------
// Stage A: universe view
// ---------------------------------------------------------------------------

fn apply_universe(
    mut lf: LazyFrame,
    universe: &Universe,
    plan: &mut Vec<String>,
) -> Result<LazyFrame> {
    for filter in &universe.filters {
        // The store hands the compiler name-form specs; id-form here means
        // a retrieval path skipped the inverse conversion.
        if !filter.include_ids.is_empty() || !filter.exclude_ids.is_empty() {
            return Err(PipelineError::Compile(format!(
                "universe filter on {:?} is still in id form",
                filter.attribute
            )));
        }
        if !filter.include.is_empty() {
            lf = lf.filter(membership(&filter.attribute, &filter.include)?);
            plan.push(format!(
                "universe filter: {} in {:?}",
                filter.attribute, filter.include
            ));
        }
        if !filter.exclude.is_empty() {
            lf = lf.filter(membership(&filter.attribute, &filter.exclude)?.not());
            plan.push(format!(
                "universe filter: {} not in {:?}",
                filter.attribute, filter.exclude
            ));
        }
    }

    if universe.timeframe == "1m" {
        if !universe.extended_hours {
            lf = lf.filter(col(EXTENDED_HOURS_COL).eq(lit(false)));
            plan.push("universe filter: regular session only".to_string());
        }
        if let Some(raw) = &universe.start_of_day {
            let minutes = parse_time_of_day(raw).ok_or_else(|| {
                PipelineError::Compile(format!("bad startOfDay {raw:?}"))
            })?;
            lf = lf.filter(minute_of_day().gt_eq(lit(i64::from(minutes))));
            plan.push(format!("universe filter: time >= {raw}"));
        }
        if let Some(raw) = &universe.end_of_day {
            let minutes = parse_time_of_day(raw).ok_or_else(|| {
                PipelineError::Compile(format!("bad endOfDay {raw:?}"))
            })?;
            lf = lf.filter(minute_of_day().lt_eq(lit(i64::from(minutes))));
            plan.push(format!("universe filter: time <= {raw}"));
        }
    }

    Ok(lf)
}

/// Minutes since midnight of the bar timestamp.
fn minute_of_day() -> Expr {
    (col(TIMESTAMP_COL).dt().hour().cast(DataType::Int64) * lit(60i64))
        + col(TIMESTAMP_COL).dt().minute().cast(DataType::Int64)
}

/// Membership predicate for one attribute against a value list.
/// Case-sensitive match on the stored canonical form; `active` is boolean.
fn membership(attribute: &str, values: &[String]) -> Result<Expr> {
    let mut combined: Option<Expr> = None;
    for value in values {
        let predicate = if attribute == "active" {
            match value.to_lowercase().as_str() {
                "true" => col("active").eq(lit(true)),
                "false" => col("active").eq(lit(false)),
                other => {
                    return Err(PipelineError::Compile(format!(
                        "active filter value {other:?} is not a boolean"
                    )))
                }
            }
        } else {
            col(attribute).eq(lit(value.clone()))
        };
        combined = Some(match combined {
            Some(acc) => acc.or(predicate),
            None => predicate,
        });
    }
    combined.ok_or_else(|| {
        PipelineError::Compile(format!("empty value list for attribute {attribute:?}"))
    })
}

// ---------------------------------------------------------------------------
// Stage B: feature columns
// ---------------------------------------------------------------------------

/// Source → window partition. Unknown sources are unreachable once the
/// validator has run; they fail hard here rather than silently degrading
/// to a per-security window.
fn partition_key(source: &Source) -> Result<Partition> {
    if source.value == SOURCE_RELATIVE {
        match source.field.as_str() {
            "" | "ticker" | "securityId" => Ok(Partition::Security),
            "sector" | "industry" | "market" | "locale" | "exchange" => {
                Ok(Partition::Attribute(source.field.clone()))
            }
            other => Err(PipelineError::Compile(format!(
                "unknown relative source field {other:?}"
            ))),
        }
    } else {
        match source.field.as_str() {
            "ticker" | "securityId" | "sector" | "industry" | "market" | "locale"
            | "exchange" => Ok(Partition::Pinned {
                field: source.field.clone(),
                value: source.value.clone(),
            }),
            other => Err(PipelineError::Compile(format!(
                "unknown pinned source field {other:?}"
            ))),
        }
    }
}

fn rolling_window(window: u32) -> RollingOptionsFixedWindow {
    RollingOptionsFixedWindow {
        window_size: window as usize,
        min_periods: 1,
        ..RollingOptionsFixedWindow::default()
    }
}

/// Moving average over the prior `window-1` bars plus the current one,
/// within the security's own series. Reads and replaces the named column;
/// the input must already be materialized so no window nests inside
/// another.
fn smooth_per_security(lf: LazyFrame, name: &str, window: u32) -> LazyFrame {
    if window > 1 {
        lf.with_column(
            col(name)
                .rolling_mean(rolling_window(window))
                .over([col(SECURITY_ID_COL)])
                .alias(name),
        )
    } else {
        lf
    }
}

fn attach_feature(
    lf: LazyFrame,
    feature: &Feature,
    timeframe: &str,
    market: &MarketStore,
    plan: &mut Vec<String>,
) -> Result<LazyFrame> {
    let name = format!("f{}", feature.feature_id);
    let raw = expr::fold_rpn(&feature.expr)?;

    let lf = match partition_key(&feature.source)? {
        Partition::Security => {
            plan.push(format!("feature {name}: per-security, window {}", feature.window));
            smooth_per_security(lf.with_column(raw.alias(&name)), &name, feature.window)
        }
        Partition::Attribute(field) => {
            plan.push(format!(
                "feature {name}: mean over ({field}, timestamp), window {}",
                feature.window
            ));
            // Cross-sectional peer mean at each timestamp; time smoothing
            // then rolls that aggregate along each security's bar sequence.
            let lf = lf.with_column(raw.alias(&name)).with_column(
                col(&name)
                    .mean()
                    .over([col(&field), col(TIMESTAMP_COL)])
                    .alias(&name),
            );
            smooth_per_security(lf, &name, feature.window)
        }
        Partition::Pinned { field, value } => {
            plan.push(format!("feature {name}: pinned to {field}={value}"));
            let peer = pinned_frame(market, timeframe, &field, &value, raw, feature.window, &name)?;
            // Joins may reorder rows; later features' lag windows need the
            // (security, timestamp) order back.
            lf.join(
                peer,
                [col(TIMESTAMP_COL)],
                [col(TIMESTAMP_COL)],
                JoinArgs::new(JoinType::Left),
            )
            .sort(
                [SECURITY_ID_COL, TIMESTAMP_COL],
                SortMultipleOptions::default(),
            )
        }
    };

    match feature.output.as_str() {
        "raw" => Ok(lf),
        "rankn" => Ok(lf.with_column(rank_ordinal(&name))),
        "rankp" => Ok(lf.with_column(rank_percent(&name))),
        other => Err(PipelineError::Compile(format!(
            "unknown output kind {other:?}"
        ))),
    }
}

/// Per-timestamp aggregate of the expression over a fixed peer group,
/// ready to left-join onto the universe frame.
fn pinned_frame(
    market: &MarketStore,
    timeframe: &str,
    field: &str,
    value: &str,
    raw: Expr,
    window: u32,
    name: &str,
) -> Result<LazyFrame> {
    let predicate = if field == "securityId" {
        let id: i64 = value.parse().map_err(|_| {
            PipelineError::Compile(format!("pinned securityId {value:?} is not an integer"))
        })?;
        col(SECURITY_ID_COL).eq(lit(id))
    } else {
        col(field).eq(lit(value.to_string()))
    };

    let peer = market
        .universe(timeframe)?
        .filter(predicate)
        .sort(
            [SECURITY_ID_COL, TIMESTAMP_COL],
            SortMultipleOptions::default(),
        )
        .with_column(raw.alias(name));
    Ok(smooth_per_security(peer, name, window)
        .group_by([col(TIMESTAMP_COL)])
        .agg([col(name).mean()]))
}

/// Ascending with-gaps integer rank across all securities at the same
/// timestamp (SQL `RANK()`).
fn rank_ordinal(name: &str) -> Expr {
    col(name)
        .rank(
            RankOptions {
                method: RankMethod::Min,
                descending: false,
            },
            None,
        )
        .over([col(TIMESTAMP_COL)])
        .cast(DataType::Float64)
        .alias(name)
}

/// Percentile rank in [0, 1] (SQL `PERCENT_RANK()`); singleton timestamp
/// groups rank at 0.
fn rank_percent(name: &str) -> Expr {
    let rank = col(name)
        .rank(
            RankOptions {
                method: RankMethod::Min,
                descending: false,
            },
            None,
        )
        .over([col(TIMESTAMP_COL)])
        .cast(DataType::Float64);
    let count = col(name)
        .count()
        .over([col(TIMESTAMP_COL)])
        .cast(DataType::Float64);
    when(count.clone().gt(lit(1.0)))
        .then((rank - lit(1.0)) / (count - lit(1.0)))
        .otherwise(lit(0.0))
        .alias(name)
}

// ---------------------------------------------------------------------------
// Stage C: filters
// ---------------------------------------------------------------------------

fn filter_expr(filter: &Filter, feature_count: usize, plan: &mut Vec<String>) -> Result<Expr> {
    if filter.feature_id >= feature_count {
        return Err(PipelineError::Compile(format!(
            "filter {:?} references undefined feature {}",
            filter.name, filter.feature_id
        )));
    }
    let lhs = col(format!("f{}", filter.feature_id));

    let (rhs, rhs_desc) = match (filter.rhs_feature_id, filter.constant) {
        (Some(_), Some(_)) => {
            return Err(PipelineError::Compile(format!(
                "filter {:?} sets both rhsFeatureId and constant",
                filter.name
            )))
        }
        (Some(id), None) => {
            if id >= feature_count {
                return Err(PipelineError::Compile(format!(
                    "filter {:?} RHS references undefined feature {id}",
                    filter.name
                )));
            }
            (col(format!("f{id}")), format!("f{id}"))
        }
        (None, Some(constant)) => (lit(constant), constant.to_string()),
        (None, None) => (lit(0.0), "0".to_string()),
    };

    let rhs = match filter.scale {
        Some(scale) if (scale - 1.0).abs() > f64::EPSILON => rhs * lit(scale),
        _ => rhs,
    };

    plan.push(format!(
        "filter: f{} {} {rhs_desc}{}",
        filter.feature_id,
        filter.operator,
        filter
            .scale
            .filter(|s| (s - 1.0).abs() > f64::EPSILON)
            .map(|s| format!(" * {s}"))
            .unwrap_or_default()
    ));

    Ok(match filter.operator.as_str() {
        "<" => lhs.lt(rhs),
        "<=" => lhs.lt_eq(rhs),
        ">" => lhs.gt(rhs),
        ">=" => lhs.gt_eq(rhs),
        other => {
            return Err(PipelineError::Compile(format!(
                "unknown comparison operator {other:?}"
            )))
        }
    })
}
