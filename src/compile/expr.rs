//! RPN → polars expression folding.
//!
//! Column parts push, operators pop two and push one; the fold must end
//! with exactly one expression. The validator guarantees this for specs
//! that reach the compiler, so any stack violation here is `CompileFailed`
//! rather than a diagnostic list.

use polars::prelude::*;

use crate::error::{PipelineError, Result};
use crate::market::SECURITY_ID_COL;
use crate::spec::ExprPart;

/// Fold an RPN token stream into one arithmetic expression evaluated per
/// row of the sorted universe frame.
pub fn fold_rpn(parts: &[ExprPart]) -> Result<Expr> {
    let mut stack: Vec<Expr> = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        if part.is_operator() {
            let rhs = stack
                .pop()
                .ok_or_else(|| stack_error(i, &part.operator))?;
            let lhs = stack
                .pop()
                .ok_or_else(|| stack_error(i, &part.operator))?;
            stack.push(apply_operator(&part.operator, lhs, rhs)?);
        } else if let Some(value) = part.literal_value() {
            stack.push(lit(value));
        } else {
            stack.push(column_ref(&part.column, part.offset)?);
        }
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(expr), true) => Ok(expr),
        (got, _) => Err(PipelineError::Compile(format!(
            "expression stack ended with {} values, expected 1",
            usize::from(got.is_some()) + stack.len()
        ))),
    }
}

fn stack_error(index: usize, operator: &str) -> PipelineError {
    PipelineError::Compile(format!(
        "operator {operator:?} at expr[{index}] has fewer than two operands"
    ))
}

/// A base-column reference, lagged by `offset` bars within the security's
/// own series. Absent prior rows default to 0, mirroring `LAG(col, k, 0)`.
fn column_ref(name: &str, offset: i64) -> Result<Expr> {
    if offset < 0 {
        return Err(PipelineError::Compile(format!(
            "column {name:?} has negative lag offset {offset}"
        )));
    }
    let base = col(name.to_lowercase()).cast(DataType::Float64);
    if offset == 0 {
        Ok(base)
    } else {
        Ok(base
            .shift(lit(offset))
            .over([col(SECURITY_ID_COL)])
            .fill_null(lit(0.0)))
    }
}

fn apply_operator(operator: &str, lhs: Expr, rhs: Expr) -> Result<Expr> {
    Ok(match operator {
        "+" => lhs + rhs,
        "-" => lhs - rhs,
        "*" => lhs * rhs,
        // Division by zero yields null, never an error or infinity.
        "/" => when(rhs.clone().eq(lit(0.0)))
            .then(lit(NULL))
            .otherwise(lhs / rhs),
        // Right-associativity comes for free from RPN evaluation order.
        "^" => lhs.pow(rhs),
        other => {
            return Err(PipelineError::Compile(format!(
                "unsupported operator {other:?}"
            )))
        }
    })
}
