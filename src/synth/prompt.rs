//! Prompt template rendering for the spec synthesizer.

use chrono::Utc;

use crate::vocab::{self, VocabularySnapshot};

const TEMPLATE: &str = include_str!("spec_prompt.md");

/// Substitute the closed and dynamic vocabulary into the prompt template.
/// All operator forms render as ASCII.
pub fn render(snapshot: &VocabularySnapshot) -> String {
    TEMPLATE
        .replace("{{current_time}}", &Utc::now().to_rfc3339())
        .replace("{{timeframes}}", &vocab::TIMEFRAMES.join(", "))
        .replace("{{attributes}}", &vocab::SECURITY_ATTRIBUTES.join(", "))
        .replace("{{output_kinds}}", &vocab::OUTPUT_KINDS.join(", "))
        .replace("{{expr_operators}}", &vocab::EXPR_OPERATORS.join(" "))
        .replace(
            "{{comparison_operators}}",
            &vocab::COMPARISON_OPERATORS.join(" "),
        )
        .replace("{{base_columns}}", &vocab::OHLCV_COLUMNS.join(", "))
        .replace("{{fundamentals}}", &join_or_none(&snapshot.fundamentals))
        .replace("{{sectors}}", &join_or_none(&snapshot.sectors))
        .replace("{{industries}}", &join_or_none(&snapshot.industries))
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "(none loaded)".to_string()
    } else {
        values.join(", ")
    }
}
