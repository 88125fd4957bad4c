//! Logical message set for the cross-core stream connect protocol.
//!
//! A transform (a directed data-flow edge between a source and a sink
//! endpoint) may span two processing cores. The cores coordinate its
//! creation and teardown by exchanging the request/response messages
//! defined here over a narrow inter-processor transport. This crate owns
//! the message shapes and the small integer-id encodings; the physical
//! wire framing below the JSON envelope belongs to the transport layer.

pub mod channel;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod status;

pub use channel::{ChannelDirection, ChannelId, MAX_DATA_CHANNELS, META_CHANNEL_NUM};
pub use codec::{decode_message, encode_message};
pub use endpoint::EndpointId;
pub use error::{MsgError, Result};
pub use message::{BufferFlags, DataFormat, Message, Role, TransformId};
pub use status::Status;
