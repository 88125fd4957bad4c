use corelink_msg::Status;

/// Errors surfaced by the protocol engine to its caller.
///
/// Mid-sequence failures (a peer rejection, a channel that would not
/// activate) are not errors in this sense: they complete the sequence
/// through its callback with a failure status after rollback. `ProtoError`
/// covers the cases where a request cannot even be started, plus
/// transport-level send failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The request named malformed or inconsistent endpoint ids.
    #[error("invalid request: {0}")]
    Validation(&'static str),

    /// A fixed-capacity table is full.
    #[error("no free {0} slots")]
    ResourceExhausted(&'static str),

    /// The peer answered a request with a failure status.
    #[error("peer rejected request with status {0:?}")]
    PeerRejected(Status),

    /// The inter-core transport could not accept a message.
    #[error("transport send failed: {0}")]
    Transport(String),

    /// Another multi-step sequence is already in flight on this link.
    #[error("link busy: {0} while a sequence is in flight")]
    StateConflict(&'static str),

    /// An inbound payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] corelink_msg::MsgError),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
