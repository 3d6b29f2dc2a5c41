//! Vocabulary registry: the authoritative sets a strategy spec is validated
//! against and the prompt template is rendered from.
//!
//! Fixed sets (timeframes, output kinds, operators, attributes, OHLCV
//! columns) are compile-time constants. Dynamic sets (sector and industry
//! name↔id maps, fundamental column names) are loaded from storage at
//! startup and refreshed on demand; they live behind a single `RwLock` so a
//! refresh swaps a whole map atomically while readers keep the snapshot
//! they acquired.

use std::sync::RwLock;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{PipelineError, Result};

pub const TIMEFRAMES: &[&str] = &["1m", "1h", "1d", "1w"];
pub const OUTPUT_KINDS: &[&str] = &["raw", "rankn", "rankp"];
/// Comparison operators are ASCII only; prompts must render these forms.
pub const COMPARISON_OPERATORS: &[&str] = &["<", "<=", ">", ">="];
pub const EXPR_OPERATORS: &[&str] = &["+", "-", "*", "/", "^"];
pub const SORT_DIRECTIONS: &[&str] = &["asc", "desc"];
pub const SECURITY_ATTRIBUTES: &[&str] = &[
    "ticker", "sector", "industry", "market", "locale", "exchange", "active",
];
pub const OHLCV_COLUMNS: &[&str] = &["open", "high", "low", "close", "volume"];

/// Largest smoothing window accepted per timeframe. Keeps a single feature
/// from dragging a year of minute bars through every window frame.
pub fn max_window(timeframe: &str) -> Option<u32> {
    match timeframe {
        "1m" => Some(20_000),
        "1h" => Some(5_000),
        "1d" => Some(1_000),
        "1w" => Some(250),
        _ => None,
    }
}

/// Which dynamic set `update_dynamic` should reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicKind {
    Sectors,
    Industries,
    Fundamentals,
}

#[derive(Default)]
struct DynamicSets {
    /// lowercase sector name → dimension id
    sector_ids: FxHashMap<String, i64>,
    /// dimension id → canonical sector name
    sector_names: FxHashMap<i64, String>,
    industry_ids: FxHashMap<String, i64>,
    industry_names: FxHashMap<i64, String>,
    /// lowercase fundamental column names
    fundamentals: FxHashSet<String>,
}

pub struct Vocabulary {
    dynamic: RwLock<DynamicSets>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        Self {
            dynamic: RwLock::new(DynamicSets::default()),
        }
    }

    /// Atomically replace one dynamic map. Name keys are lowercased so
    /// lookups are case-insensitive; the id→name side keeps canonical case.
    pub fn update_dynamic(&self, kind: DynamicKind, entries: Vec<(i64, String)>) {
        let mut guard = self.dynamic.write().expect("vocabulary lock poisoned");
        match kind {
            DynamicKind::Sectors => {
                guard.sector_ids = entries
                    .iter()
                    .map(|(id, name)| (name.to_lowercase(), *id))
                    .collect();
                guard.sector_names = entries.into_iter().collect();
            }
            DynamicKind::Industries => {
                guard.industry_ids = entries
                    .iter()
                    .map(|(id, name)| (name.to_lowercase(), *id))
                    .collect();
                guard.industry_names = entries.into_iter().collect();
            }
            DynamicKind::Fundamentals => {
                guard.fundamentals = entries
                    .into_iter()
                    .map(|(_, name)| name.to_lowercase())
                    .collect();
            }
        }
    }

    pub fn is_timeframe(&self, value: &str) -> bool {
        TIMEFRAMES.contains(&value)
    }

    pub fn is_output_kind(&self, value: &str) -> bool {
        OUTPUT_KINDS.contains(&value)
    }

    pub fn is_comparison_operator(&self, value: &str) -> bool {
        COMPARISON_OPERATORS.contains(&value)
    }

    pub fn is_expr_operator(&self, value: &str) -> bool {
        EXPR_OPERATORS.contains(&value)
    }

    pub fn is_sort_direction(&self, value: &str) -> bool {
        SORT_DIRECTIONS.contains(&value)
    }

    pub fn is_security_attribute(&self, value: &str) -> bool {
        SECURITY_ATTRIBUTES.contains(&value)
    }

    /// Case-insensitive base-column lookup: OHLCV or a loaded fundamental.
    pub fn is_base_column(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        if OHLCV_COLUMNS.contains(&lower.as_str()) {
            return true;
        }
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        guard.fundamentals.contains(&lower)
    }

    pub fn sector_id(&self, name: &str) -> Option<i64> {
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        guard.sector_ids.get(&name.to_lowercase()).copied()
    }

    pub fn sector_name(&self, id: i64) -> Option<String> {
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        guard.sector_names.get(&id).cloned()
    }

    pub fn industry_id(&self, name: &str) -> Option<i64> {
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        guard.industry_ids.get(&name.to_lowercase()).copied()
    }

    pub fn industry_name(&self, id: i64) -> Option<String> {
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        guard.industry_names.get(&id).cloned()
    }

    /// Sorted copies of the dynamic sets, for prompt rendering and the
    /// spec-describing tool responses.
    pub fn snapshot(&self) -> VocabularySnapshot {
        let guard = self.dynamic.read().expect("vocabulary lock poisoned");
        let mut sectors: Vec<String> = guard.sector_names.values().cloned().collect();
        let mut industries: Vec<String> = guard.industry_names.values().cloned().collect();
        let mut fundamentals: Vec<String> = guard.fundamentals.iter().cloned().collect();
        sectors.sort();
        industries.sort();
        fundamentals.sort();
        VocabularySnapshot {
            sectors,
            industries,
            fundamentals,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VocabularySnapshot {
    pub sectors: Vec<String>,
    pub industries: Vec<String>,
    pub fundamentals: Vec<String>,
}

/// Load all three dynamic sets at startup.
///
/// A single failed load logs a warning and leaves that set empty (degraded
/// mode; specs referencing it will fail validation with a clear message).
/// All three failing means the registry is useless and startup should stop.
pub fn init(
    vocab: &Vocabulary,
    sectors: Result<Vec<(i64, String)>>,
    industries: Result<Vec<(i64, String)>>,
    fundamentals: Result<Vec<String>>,
) -> Result<()> {
    let mut failures = Vec::new();

    match sectors {
        Ok(entries) => vocab.update_dynamic(DynamicKind::Sectors, entries),
        Err(e) => {
            tracing::warn!(error = %e, "sector vocabulary load failed");
            failures.push(format!("sectors: {e}"));
        }
    }
    match industries {
        Ok(entries) => vocab.update_dynamic(DynamicKind::Industries, entries),
        Err(e) => {
            tracing::warn!(error = %e, "industry vocabulary load failed");
            failures.push(format!("industries: {e}"));
        }
    }
    match fundamentals {
        Ok(columns) => vocab.update_dynamic(
            DynamicKind::Fundamentals,
            columns.into_iter().map(|c| (0, c)).collect(),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "fundamental vocabulary load failed");
            failures.push(format!("fundamentals: {e}"));
        }
    }

    if failures.len() == 3 {
        return Err(PipelineError::VocabularyInit(failures.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_vocab() -> Vocabulary {
        let vocab = Vocabulary::new();
        vocab.update_dynamic(
            DynamicKind::Sectors,
            vec![(1, "Technology".to_string()), (2, "Energy".to_string())],
        );
        vocab.update_dynamic(
            DynamicKind::Fundamentals,
            vec![(0, "market_cap".to_string()), (0, "pe_ratio".to_string())],
        );
        vocab
    }

    #[test]
    fn fixed_sets_contain_expected_members() {
        let vocab = Vocabulary::new();
        assert!(vocab.is_timeframe("1d"));
        assert!(!vocab.is_timeframe("5m"));
        assert!(vocab.is_output_kind("rankp"));
        assert!(vocab.is_comparison_operator(">="));
        assert!(!vocab.is_comparison_operator("≥"));
        assert!(vocab.is_expr_operator("^"));
        assert!(vocab.is_security_attribute("exchange"));
    }

    #[test]
    fn base_columns_are_case_insensitive() {
        let vocab = loaded_vocab();
        assert!(vocab.is_base_column("Close"));
        assert!(vocab.is_base_column("MARKET_CAP"));
        assert!(!vocab.is_base_column("nonexistent"));
    }

    #[test]
    fn sector_lookup_round_trips() {
        let vocab = loaded_vocab();
        assert_eq!(vocab.sector_id("technology"), Some(1));
        assert_eq!(vocab.sector_name(1).as_deref(), Some("Technology"));
        assert_eq!(vocab.sector_id("unknown"), None);
    }

    #[test]
    fn update_dynamic_replaces_whole_map() {
        let vocab = loaded_vocab();
        vocab.update_dynamic(DynamicKind::Sectors, vec![(3, "Utilities".to_string())]);
        assert_eq!(vocab.sector_id("technology"), None);
        assert_eq!(vocab.sector_id("utilities"), Some(3));
    }

    #[test]
    fn init_degrades_on_partial_failure_and_fails_on_total() {
        let vocab = Vocabulary::new();
        let partial = init(
            &vocab,
            Ok(vec![(1, "Technology".to_string())]),
            Err(PipelineError::Transport("db down".into())),
            Ok(vec!["market_cap".to_string()]),
        );
        assert!(partial.is_ok());
        assert!(vocab.is_base_column("market_cap"));

        let total = init(
            &vocab,
            Err(PipelineError::Transport("down".into())),
            Err(PipelineError::Transport("down".into())),
            Err(PipelineError::Transport("down".into())),
        );
        assert!(matches!(total, Err(PipelineError::VocabularyInit(_))));
    }

    #[test]
    fn readers_see_consistent_snapshots_under_concurrent_swap() {
        use std::sync::Arc;
        let vocab = Arc::new(loaded_vocab());

        let reader = {
            let vocab = Arc::clone(&vocab);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    // Either the old or the new map, never a torn mix.
                    let tech = vocab.sector_id("technology");
                    let util = vocab.sector_id("utilities");
                    assert!(tech.is_some() || util.is_some());
                }
            })
        };
        let writer = {
            let vocab = Arc::clone(&vocab);
            std::thread::spawn(move || {
                for i in 0..100 {
                    let set = if i % 2 == 0 {
                        vec![(3, "Utilities".to_string())]
                    } else {
                        vec![(1, "Technology".to_string())]
                    };
                    vocab.update_dynamic(DynamicKind::Sectors, set);
                }
            })
        };
        reader.join().unwrap();
        writer.join().unwrap();
    }
}
