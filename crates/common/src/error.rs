use thiserror::Error;

/// Canonical error taxonomy shared by every Tessera crate.
///
/// Classification guidance:
/// - [`TesseraError::InvalidConfig`]: bad operator options or function/type combinations,
///   reported synchronously when an operator is constructed
/// - [`TesseraError::ResourceExhausted`]: memory or spill capacity ran out; fatal
/// - [`TesseraError::Collective`]: a collective call failed; fatal because peers may
///   already be blocked on the same call
/// - [`TesseraError::Execution`]: data/shape errors discovered while running
/// - [`TesseraError::Io`]: raw filesystem failures from spill storage
/// - [`TesseraError::Unsupported`]: valid request for an unimplemented shape
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Invalid or inconsistent operator configuration.
    ///
    /// Examples:
    /// - `mean` requested over a Utf8 column
    /// - key count larger than the schema width
    /// - malformed environment override
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Memory or spill capacity was exhausted.
    ///
    /// Examples:
    /// - every spill location is over quota
    /// - a partition still does not fit after the maximum repartition depth
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Collective communication failed (peer aborted, transport error).
    #[error("collective failure: {0}")]
    Collective(String),

    /// Runtime failures after configuration succeeded.
    ///
    /// Examples:
    /// - IPC encode/decode failures
    /// - dictionary unification mismatches
    /// - schema drift between batches
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<arrow::error::ArrowError> for TesseraError {
    fn from(err: arrow::error::ArrowError) -> Self {
        TesseraError::Execution(format!("arrow: {err}"))
    }
}

/// Standard Tessera result alias.
pub type Result<T> = std::result::Result<T, TesseraError>;
