/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A list-carrying message declared a count that does not match its list.
    #[error("count mismatch in {message}: declared {declared}, got {actual}")]
    CountMismatch {
        message: &'static str,
        declared: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, MsgError>;
