//! Connect/disconnect protocol engine for cross-core transforms.
//!
//! One [`Link`] instance runs on each core of a pair and coordinates
//! the lifetime of transforms whose source and sink live on different
//! cores: multi-step connect sequences, batch disconnects, rollback of
//! half-built state and the bookkeeping registries behind it all. The
//! engine is transport-agnostic and single-threaded; everything below
//! it (channels, endpoints, the message FIFO) is reached through the
//! traits in [`ipc`].

pub mod endpoint;
pub mod error;
pub mod ipc;
pub mod link;
pub mod transform;

pub use endpoint::{Endpoint, EndpointKind, EndpointRegistry, MAX_ENDPOINTS};
pub use error::{ProtoError, Result};
pub use ipc::{
    Buffer, BufferDetails, ChannelManager, CoreId, EndpointHost, EndpointProperty, Fault,
    MessageSender, SendError, METADATA_BUFFER_SIZE,
};
pub use link::{ConnectCallback, DisconnectCallback, Link};
pub use transform::{Transform, TransformRegistry, MAX_TRANSFORMS};
