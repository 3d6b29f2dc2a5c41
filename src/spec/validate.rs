//! Pure, deterministic validation of a [`StrategySpec`] against the
//! vocabulary registry and the structural invariants.
//!
//! Every check runs; diagnostics accumulate in path order instead of
//! short-circuiting, so the synthesizer's repair loop gets stable targets
//! like `feature[2].expr[4]: ...` to feed back to the model.

use rustc_hash::FxHashSet;

use super::{ExprPart, Feature, Filter, SortBy, StrategySpec, Universe, SOURCE_RELATIVE};
use crate::vocab::{self, Vocabulary};

/// Words that may never appear as feature/filter identifiers. Identifiers
/// end up interpolated into query column names; the closed list plus the
/// shape check below keeps them inert.
const RESERVED_WORDS: &[&str] = &[
    "select", "from", "where", "group", "order", "by", "having", "limit", "offset", "join",
    "inner", "outer", "left", "right", "on", "as", "and", "or", "not", "union", "insert",
    "update", "delete", "drop", "create", "table", "index", "values", "set", "into", "case",
    "when", "then", "else", "end", "null", "true", "false", "between", "like", "in", "exists",
    "distinct", "all", "asc", "desc", "cast", "over", "partition", "window",
];

/// Validate a spec. `Ok(())` or every diagnostic found, in path order.
pub fn validate(spec: &StrategySpec, vocab: &Vocabulary) -> Result<(), Vec<String>> {
    let mut diags = Vec::new();

    check_universe(&spec.universe, vocab, &mut diags);

    for feature in &spec.features {
        check_feature(feature, &spec.universe.timeframe, vocab, &mut diags);
    }
    check_feature_id_contiguity(&spec.features, &mut diags);

    for (i, filter) in spec.filters.iter().enumerate() {
        check_filter(i, filter, spec.features.len(), vocab, &mut diags);
    }

    if let Some(sort_by) = &spec.sort_by {
        check_sort_by(sort_by, spec.features.len(), vocab, &mut diags);
    }

    if diags.is_empty() {
        Ok(())
    } else {
        Err(diags)
    }
}

fn check_universe(universe: &Universe, vocab: &Vocabulary, diags: &mut Vec<String>) {
    if !vocab.is_timeframe(&universe.timeframe) {
        diags.push(format!(
            "universe.timeframe: {:?} is not a valid timeframe (expected one of {})",
            universe.timeframe,
            vocab::TIMEFRAMES.join(", ")
        ));
    }

    let is_minute = universe.timeframe == "1m";
    if universe.extended_hours && !is_minute {
        diags.push("universe.extendedHours: only valid at the 1m timeframe".to_string());
    }
    if !is_minute {
        if universe.start_of_day.is_some() {
            diags.push("universe.startOfDay: only valid at the 1m timeframe".to_string());
        }
        if universe.end_of_day.is_some() {
            diags.push("universe.endOfDay: only valid at the 1m timeframe".to_string());
        }
    }
    for (label, value) in [
        ("startOfDay", &universe.start_of_day),
        ("endOfDay", &universe.end_of_day),
    ] {
        if let Some(raw) = value {
            if parse_time_of_day(raw).is_none() {
                diags.push(format!(
                    "universe.{label}: {raw:?} is not a valid HH:MM time"
                ));
            }
        }
    }

    for (i, filter) in universe.filters.iter().enumerate() {
        let path = format!("universe.filters[{i}]");
        if !vocab.is_security_attribute(&filter.attribute) {
            diags.push(format!(
                "{path}.attribute: {:?} is not a security attribute",
                filter.attribute
            ));
        }

        // Disjointness is case-insensitive; storage matching is not.
        let include: FxHashSet<String> =
            filter.include.iter().map(|v| v.to_lowercase()).collect();
        let overlap: Vec<&String> = filter
            .exclude
            .iter()
            .filter(|v| include.contains(&v.to_lowercase()))
            .collect();
        if let Some(first) = overlap.first() {
            diags.push(format!(
                "{path}: {first:?} appears in both include and exclude"
            ));
        }

        let id_include: FxHashSet<i64> = filter.include_ids.iter().copied().collect();
        if filter.exclude_ids.iter().any(|id| id_include.contains(id)) {
            diags.push(format!(
                "{path}: overlapping include and exclude ids"
            ));
        }
    }
}

/// Parse `HH:MM` into minutes since midnight.
pub fn parse_time_of_day(raw: &str) -> Option<u32> {
    let (h, m) = raw.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn check_feature(
    feature: &Feature,
    timeframe: &str,
    vocab: &Vocabulary,
    diags: &mut Vec<String>,
) {
    let path = format!("feature[{}]", feature.feature_id);

    if let Some(reason) = identifier_problem(&feature.name) {
        diags.push(format!("{path}.name: {reason}"));
    }

    if !vocab.is_output_kind(&feature.output) {
        diags.push(format!(
            "{path}.output: {:?} is not one of {}",
            feature.output,
            vocab::OUTPUT_KINDS.join(", ")
        ));
    }

    check_source(&path, feature, vocab, diags);

    if feature.window < 1 {
        diags.push(format!("{path}.window: must be >= 1"));
    }
    if let Some(cap) = vocab::max_window(timeframe) {
        if feature.window > cap {
            diags.push(format!(
                "{path}.window: {} exceeds the {timeframe} cap of {cap}",
                feature.window
            ));
        }
    }

    check_expression(&path, &feature.expr, vocab, diags);
}

fn check_source(path: &str, feature: &Feature, vocab: &Vocabulary, diags: &mut Vec<String>) {
    let source = &feature.source;
    match source.field.as_str() {
        "ticker" | "securityId" | "sector" | "industry" | "market" | "locale" | "exchange" => {}
        "" => diags.push(format!("{path}.source.field: must not be empty")),
        other => diags.push(format!(
            "{path}.source.field: {other:?} is not a valid source field"
        )),
    }
    if source.value.is_empty() {
        diags.push(format!(
            "{path}.source.value: must be {SOURCE_RELATIVE:?} or a pinned peer value"
        ));
    }
    // A pinned sector/industry must resolve against the loaded dimension so
    // the compiler never chases a peer group that cannot exist.
    if source.value != SOURCE_RELATIVE {
        match source.field.as_str() {
            "sector" if vocab.sector_id(&source.value).is_none() => diags.push(format!(
                "{path}.source.value: unknown sector {:?}",
                source.value
            )),
            "industry" if vocab.industry_id(&source.value).is_none() => diags.push(format!(
                "{path}.source.value: unknown industry {:?}",
                source.value
            )),
            _ => {}
        }
    }
}

fn check_expression(path: &str, expr: &[ExprPart], vocab: &Vocabulary, diags: &mut Vec<String>) {
    if expr.is_empty() {
        diags.push(format!("{path}.expr: must not be empty"));
        return;
    }

    // Simulate the RPN stack: columns push, operators pop two and push one.
    let mut depth: i64 = 0;
    for (i, part) in expr.iter().enumerate() {
        let part_path = format!("{path}.expr[{i}]");
        match (part.column.is_empty(), part.operator.is_empty()) {
            (true, true) => {
                diags.push(format!("{part_path}: neither column nor operator set"));
                continue;
            }
            (false, false) => {
                diags.push(format!("{part_path}: both column and operator set"));
                continue;
            }
            (false, true) => {
                if let Some(_literal) = part.literal_value() {
                    if part.offset != 0 {
                        diags.push(format!(
                            "{part_path}.offset: numeric literals cannot be lagged"
                        ));
                    }
                } else {
                    if !vocab.is_base_column(&part.column) {
                        diags.push(format!(
                            "{part_path}.column: {:?} is not an OHLCV or fundamental column",
                            part.column
                        ));
                    }
                    if part.offset < 0 {
                        diags.push(format!("{part_path}.offset: must be >= 0"));
                    }
                }
                depth += 1;
            }
            (true, false) => {
                if !vocab.is_expr_operator(&part.operator) {
                    diags.push(format!(
                        "{part_path}.operator: {:?} is not one of {}",
                        part.operator,
                        vocab::EXPR_OPERATORS.join(" ")
                    ));
                }
                if part.offset != 0 {
                    diags.push(format!("{part_path}.offset: must be 0 on operators"));
                }
                if depth < 2 {
                    diags.push(format!(
                        "{part_path}: operator {:?} has fewer than two operands",
                        part.operator
                    ));
                    // Model the pop anyway so one bad operator doesn't
                    // cascade into noise for the rest of the expression.
                    depth = (depth - 2).max(0);
                } else {
                    depth -= 2;
                }
                depth += 1;
            }
        }
    }

    if depth != 1 {
        diags.push(format!(
            "{path}.expr: evaluates to {depth} values, expected exactly 1"
        ));
    }
}

fn check_feature_id_contiguity(features: &[Feature], diags: &mut Vec<String>) {
    let mut seen: FxHashSet<usize> = FxHashSet::default();
    for feature in features {
        if !seen.insert(feature.feature_id) {
            diags.push(format!(
                "feature[{}].featureId: duplicate id",
                feature.feature_id
            ));
        }
    }
    for id in 0..features.len() {
        if !seen.contains(&id) {
            diags.push(format!(
                "features: ids must cover 0..{} contiguously, missing {id}",
                features.len()
            ));
        }
    }
}

fn check_filter(
    index: usize,
    filter: &Filter,
    feature_count: usize,
    vocab: &Vocabulary,
    diags: &mut Vec<String>,
) {
    let path = format!("filter[{index}]");

    if let Some(reason) = identifier_problem(&filter.name) {
        diags.push(format!("{path}.name: {reason}"));
    }
    if filter.feature_id >= feature_count {
        diags.push(format!(
            "{path}.featureId: {} does not reference a defined feature",
            filter.feature_id
        ));
    }
    if !vocab.is_comparison_operator(&filter.operator) {
        diags.push(format!(
            "{path}.operator: {:?} is not one of {}",
            filter.operator,
            vocab::COMPARISON_OPERATORS.join(" ")
        ));
    }
    match (filter.rhs_feature_id, filter.constant) {
        (Some(_), Some(_)) => diags.push(format!(
            "{path}: rhsFeatureId and constant are mutually exclusive"
        )),
        (Some(rhs), None) if rhs >= feature_count => diags.push(format!(
            "{path}.rhsFeatureId: {rhs} does not reference a defined feature"
        )),
        // Neither set compares against zero, which is always valid.
        _ => {}
    }
}

fn check_sort_by(
    sort_by: &SortBy,
    feature_count: usize,
    vocab: &Vocabulary,
    diags: &mut Vec<String>,
) {
    if sort_by.is_noop() {
        return;
    }
    if !vocab.is_sort_direction(&sort_by.direction) {
        diags.push(format!(
            "sortBy.direction: {:?} is not one of {}",
            sort_by.direction,
            vocab::SORT_DIRECTIONS.join(", ")
        ));
    }
    if sort_by.feature_id >= feature_count {
        diags.push(format!(
            "sortBy.featureId: {} does not reference a defined feature",
            sort_by.feature_id
        ));
    }
}

/// Identifier safety: shape check plus the reserved-word list.
fn identifier_problem(name: &str) -> Option<String> {
    let mut chars = name.chars();
    let valid_shape = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid_shape {
        return Some(format!(
            "{name:?} is not a valid identifier (letters, digits, underscore; must not start with a digit)"
        ));
    }
    if RESERVED_WORDS.contains(&name.to_lowercase().as_str()) {
        return Some(format!("{name:?} is a reserved word"));
    }
    None
}
