use thiserror::Error;

/// Domain errors for the strategy pipeline.
///
/// Each variant maps to one failure kind the pipeline distinguishes; tool
/// handlers render them as MCP error strings, the synthesizer intercepts
/// `Validation` for its repair loop, everything else propagates verbatim.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The spec violates one or more structural invariants. The message is a
    /// `; `-joined list of diagnostics ordered by path.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The NL synthesizer exhausted its attempt budget.
    #[error("synthesis failed after {attempts} attempts: {diagnostic}")]
    Synthesis {
        attempts: usize,
        diagnostic: String,
        /// Raw text of the last model response, for operator diagnosis.
        last_response: String,
    },

    /// The spec passed validation but the compiler hit an unsupported shape.
    #[error("compile failed: {0}")]
    Compile(String),

    /// The storage engine rejected or aborted the compiled query. The plan
    /// text is logged for operators and never returned to end users.
    #[error("query failed: {message}")]
    Query { message: String, plan: String },

    /// A derivation was requested but no cached result exists for the key.
    #[error("no cached backtest result for strategy {0}; run the backtest first")]
    CacheMiss(i64),

    /// A derivation found no valid values for the requested column.
    #[error("{0}")]
    Value(String),

    /// The strategy doesn't exist or belongs to someone else. Presented
    /// identically in both cases so existence never leaks.
    #[error("strategy not found")]
    NotFoundOrForbidden,

    #[error("operation cancelled")]
    Cancelled,

    /// Model / cache / dispatch transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// All dynamic vocabulary loads failed at startup.
    #[error("vocabulary initialization failed: {0}")]
    VocabularyInit(String),

    #[error("store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}

impl PipelineError {
    /// Join accumulated validator diagnostics into a single `Validation`
    /// error, preserving path order.
    pub fn from_diagnostics(diagnostics: &[String]) -> Self {
        PipelineError::Validation(diagnostics.join("; "))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
