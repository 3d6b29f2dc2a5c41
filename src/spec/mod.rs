//! The declarative strategy specification: what the NL synthesizer emits,
//! the validator checks, the store persists, and the compiler executes.
//!
//! Field names follow the wire form (camelCase) because these structs are
//! deserialized straight from model output and tool parameters. Enumerable
//! values stay as strings checked against the vocabulary registry: the
//! closed sets are the registry's, not the type system's, so the repair
//! loop can report "invalid timeframe" instead of a deserialization error.

pub mod validate;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Complete strategy specification: a universe, derived features, filters
/// over those features, and optional ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    pub universe: Universe,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
}

/// The (security, timestamp) population considered before features run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Universe {
    /// One of `1m`, `1h`, `1d`, `1w`.
    #[serde(default)]
    pub timeframe: String,
    /// Include pre/post-market bars. Minute timeframe only.
    #[serde(default)]
    pub extended_hours: bool,
    /// Intraday session start, `HH:MM`. Minute timeframe only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_of_day: Option<String>,
    /// Intraday session end, `HH:MM`. Minute timeframe only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_day: Option<String>,
    #[serde(default)]
    pub filters: Vec<UniverseFilter>,
}

/// Include/exclude lists bound to one security attribute.
///
/// The API form carries names; the stored form carries ids for the
/// enumerated dimensions (sector, industry) with the name lists cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniverseFilter {
    /// One of ticker, sector, industry, market, locale, exchange, active.
    pub attribute: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_ids: Vec<i64>,
}

/// A per-row derived value: an RPN expression over base columns, optionally
/// smoothed over a window and/or replaced by a per-timestamp rank.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    pub feature_id: usize,
    #[serde(default)]
    pub source: Source,
    /// One of `raw`, `rankn`, `rankp`.
    #[serde(default = "default_output")]
    pub output: String,
    pub expr: Vec<ExprPart>,
    /// Moving-average window in bars; 1 means no smoothing.
    #[serde(default = "default_window")]
    pub window: u32,
}

fn default_output() -> String {
    "raw".to_string()
}

fn default_window() -> u32 {
    1
}

/// Where a feature's values come from.
///
/// `value == "relative"` means "the row's own value of `field`": with
/// `field = "ticker"` the feature is per-security; with `field = "sector"`
/// the feature aggregates over the row's own sector peers. Any other value
/// pins the feature to a fixed peer group, e.g. `{field: "ticker",
/// value: "SPY"}` compares every row against SPY.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default = "default_source_field")]
    pub field: String,
    #[serde(default = "default_source_value")]
    pub value: String,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            field: default_source_field(),
            value: default_source_value(),
        }
    }
}

fn default_source_field() -> String {
    "ticker".to_string()
}

fn default_source_value() -> String {
    "relative".to_string()
}

pub const SOURCE_RELATIVE: &str = "relative";

/// One element of a Reverse Polish expression: a column reference (possibly
/// lagged, possibly a numeric literal) or a binary operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExprPart {
    /// Base column name or numeric literal. Empty for operator parts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub column: String,
    /// One of `+ - * / ^`. Empty for column parts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    /// Lag in bars: 0 is the current row, k the row k steps earlier within
    /// the same security's series. Must be 0 on operators and literals.
    #[serde(default)]
    pub offset: i64,
}

impl ExprPart {
    pub fn column(name: &str) -> Self {
        Self {
            column: name.to_string(),
            ..Self::default()
        }
    }

    pub fn lagged(name: &str, offset: i64) -> Self {
        Self {
            column: name.to_string(),
            offset,
            ..Self::default()
        }
    }

    pub fn operator(op: &str) -> Self {
        Self {
            operator: op.to_string(),
            ..Self::default()
        }
    }

    pub fn is_operator(&self) -> bool {
        !self.operator.is_empty()
    }

    /// Numeric literals are allowed in column position (`"1"`, `"0.5"`).
    pub fn literal_value(&self) -> Option<f64> {
        self.column.parse::<f64>().ok()
    }
}

/// A predicate over computed features: `f{featureId} OP rhs`.
///
/// The RHS is another feature (`rhsFeatureId`) or a `constant`, optionally
/// multiplied by `scale`; with neither set the comparison is against zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub name: String,
    pub feature_id: usize,
    /// One of `<`, `<=`, `>`, `>=` (ASCII).
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs_feature_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

/// Result ordering. An empty direction (the zero value) is a no-op; the
/// natural `(securityId, timestamp)` tiebreak always applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SortBy {
    #[serde(default)]
    pub feature_id: usize,
    #[serde(default)]
    pub direction: String,
}

impl SortBy {
    pub fn is_noop(&self) -> bool {
        self.direction.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_wire_form() {
        let json = r#"{
            "universe": {
                "timeframe": "1d",
                "filters": [
                    {"attribute": "ticker", "include": ["GLD"], "exclude": []}
                ]
            },
            "features": [{
                "name": "gap",
                "featureId": 0,
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
            "filters": [
                {"name": "gap_big", "featureId": 0, "operator": ">", "constant": 0.03}
            ]
        }"#;

        let spec: StrategySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.universe.timeframe, "1d");
        assert_eq!(spec.features.len(), 1);
        assert_eq!(spec.features[0].expr.len(), 5);
        assert_eq!(spec.features[0].expr[1].offset, 1);
        assert!(spec.features[0].expr[2].is_operator());
        assert_eq!(spec.features[0].expr[3].literal_value(), Some(1.0));
        assert_eq!(spec.filters[0].constant, Some(0.03));
        assert!(spec.sort_by.is_none());
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let json = r#"{
            "universe": {"timeframe": "1d"},
            "features": [{
                "name": "chg",
                "featureId": 0,
                "expr": [{"column": "close"}]
            }]
        }"#;
        let spec: StrategySpec = serde_json::from_str(json).unwrap();
        let f = &spec.features[0];
        assert_eq!(f.output, "raw");
        assert_eq!(f.window, 1);
        assert_eq!(f.source.field, "ticker");
        assert_eq!(f.source.value, SOURCE_RELATIVE);
    }

    #[test]
    fn stored_form_survives_round_trip() {
        let mut spec = StrategySpec {
            universe: Universe {
                timeframe: "1d".to_string(),
                ..Universe::default()
            },
            ..StrategySpec::default()
        };
        spec.universe.filters.push(UniverseFilter {
            attribute: "sector".to_string(),
            include_ids: vec![3, 7],
            ..UniverseFilter::default()
        });

        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("includeIds"));
        let back: StrategySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.universe.filters[0].include_ids, vec![3, 7]);
    }
}
