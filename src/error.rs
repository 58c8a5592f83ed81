use crate::request::RequestStatus;

/// Business rejections surfaced verbatim to the caller. None of these are
/// transient faults, so there is no retry path anywhere in the engine.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("this request has already been processed (status: {status})")]
    AlreadyProcessed { status: RequestStatus },
    #[error("insufficient stock for {sku}: requested {requested}, on hand {on_hand}")]
    StockInsufficient {
        sku: String,
        requested: i64,
        on_hand: i64,
    },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One variant per verification failure so the caller can message each
/// distinctly.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed action token")]
    Malformed,
    #[error("action token signature mismatch")]
    BadSignature,
    #[error("action token is missing required fields")]
    MissingFields,
    #[error("action token expired")]
    Expired,
}

impl WorkflowError {
    /// Re-invoking a resolved request is a no-op report, not a destructive
    /// failure the caller must handle.
    pub fn is_already_processed(&self) -> bool {
        matches!(self, WorkflowError::AlreadyProcessed { .. })
    }
}
