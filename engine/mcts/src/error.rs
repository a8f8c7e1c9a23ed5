//! Search error taxonomy.

use thiserror::Error;

/// Failures surfaced by the search core.
///
/// `BadInput` rejects the offending command and leaves state untouched;
/// `ExternalUnavailable` aborts the current search but still answers with a
/// best-effort `bestmove`; the others are not recoverable mid-game.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("bad input: {0}")]
    BadInput(#[from] position::PositionError),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(#[from] prediction_cache::CacheError),

    #[error("evaluator unavailable: {0}")]
    ExternalUnavailable(#[from] crate::evaluator::EvaluatorError),
}
