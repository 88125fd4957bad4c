use serde::{Deserialize, Serialize};

/// Outcome code carried in protocol responses and completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    /// The peer could not carry out the request.
    CmdFailed,
    /// The request named an unknown or malformed entity.
    InvalidParams,
    /// The request was accepted; the outcome arrives asynchronously.
    Pending,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}
