//! Error taxonomy for request resolution.
//!
//! Not-found outcomes and mutation rejections are values, never errors.
//! Everything here is a hard failure that unwinds to the request boundary
//! and rolls the Unit-of-Work back.

use diskuze_state::StorageError;

/// Hard failures raised while resolving one request.
///
/// `Clone` so a single batch outcome can be handed to every caller that
/// was waiting on the same window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("loader contract violated for {kind}: {detail}")]
    LoaderContract { kind: &'static str, detail: String },

    #[error("unit of work is no longer open")]
    TransactionClosed,
}

impl ResolveError {
    pub(crate) fn contract(kind: &'static str, detail: impl Into<String>) -> Self {
        ResolveError::LoaderContract {
            kind,
            detail: detail.into(),
        }
    }
}

/// Result type for request resolution.
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;
