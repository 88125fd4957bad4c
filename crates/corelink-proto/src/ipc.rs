//! Collaborator seams between the protocol engine and its host.
//!
//! The engine never touches hardware, shared memory or the message
//! transport directly. It drives three narrow traits: [`ChannelManager`]
//! for the inter-processor data channels, [`EndpointHost`] for the
//! streaming endpoints living on this core, and [`MessageSender`] for
//! the control transport to the peer. Tests substitute scripted
//! implementations; the binary wires in an in-memory simulation.

use corelink_msg::{ChannelDirection, ChannelId, DataFormat, EndpointId, Status, TransformId};

use crate::error::Result;

/// Size of the shared circular buffer backing a metadata companion
/// channel, in octets.
pub const METADATA_BUFFER_SIZE: usize = 256;

/// Identifier of a processing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(pub u8);

/// Descriptor of a shared circular buffer visible to both cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Capacity in octets.
    pub capacity: usize,
    /// How many octets of each word carry payload. 0 means the full word.
    pub usable_octets: u16,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Buffer {
            capacity,
            usable_octets: 0,
        }
    }
}

/// What an endpoint asks of the buffer that will back its edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDetails {
    /// Minimum buffer size in octets.
    pub size: usize,
    /// Whether the endpoint produces or consumes metadata.
    pub supports_metadata: bool,
}

/// Configuration applied to a local endpoint while a sequence runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointProperty {
    /// Sample encoding the proxy must present.
    DataFormat(DataFormat),
    /// Size of the shared buffer a proxy endpoint will front.
    ShadowBufferSize(usize),
    /// Data channel the proxy reads or writes.
    DataChannel(ChannelId),
    /// Metadata companion channel for the proxy.
    MetadataChannelId(ChannelId),
    /// Whether metadata flows across this edge.
    MetadataSupport(bool),
    /// The proxy adopts the remotely allocated buffer instead of
    /// allocating its own.
    CloneRemoteBuffer(bool),
    /// Usable octets per word, mirrored from the other side.
    UsableOctets(u16),
}

/// Conditions worth escalating beyond a failed response.
///
/// These indicate a protocol peer misbehaving or local state corruption,
/// not an operation that merely could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A channel event arrived with no connect sequence in flight.
    UnexpectedChannelEvent,
    /// A response carried a transform id that was never handed out.
    TransformIdMismatch,
    /// The peer failed to destroy endpoints it was asked to roll back.
    EndpointDestroyFailed,
    /// A disconnect response did not account for the requested set.
    DisconnectInconsistent,
    /// A channel event named an endpoint this core no longer holds.
    MissingEndpoint,
}

/// Error from the control transport; carries no protocol meaning.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SendError(pub String);

/// Inter-processor data-channel operations.
///
/// Channel ids handed back are fully bound: the manager assigns the
/// port group when `port` is 0.
pub trait ChannelManager {
    /// Create a data channel. `number` is the requested channel number
    /// within the port; `port` 0 lets the manager pick a port group.
    fn create_channel(
        &mut self,
        port: u16,
        number: u16,
        direction: ChannelDirection,
    ) -> Result<ChannelId>;

    /// Bind a channel to a shared buffer and start it. With `create_new`
    /// false the manager allocates the backing buffer itself from
    /// `buffer.capacity`. Returns `Pending` when completion is reported
    /// through a later activation event instead of inline.
    fn activate_channel(
        &mut self,
        channel: ChannelId,
        peer: CoreId,
        buffer: Buffer,
        create_new: bool,
    ) -> Status;

    fn deactivate_channel(&mut self, channel: ChannelId) -> Status;

    fn destroy_channel(&mut self, channel: ChannelId) -> Status;

    /// Buffer currently bound to an active channel.
    fn buffer_for(&self, channel: ChannelId) -> Option<Buffer>;

    /// Record the usable octets of the buffer bound to `channel`.
    fn set_usable_octets(&mut self, channel: ChannelId, octets: u16);
}

/// Operations on the streaming endpoints hosted by this core.
pub trait EndpointHost {
    /// Buffer requirements of the local endpoint backing `endpoint`.
    fn buffer_details(&self, endpoint: EndpointId) -> Result<BufferDetails>;

    fn configure(&mut self, endpoint: EndpointId, property: EndpointProperty) -> Result<()>;

    /// Sample encoding produced or expected by a local endpoint.
    fn data_format(&self, endpoint: EndpointId) -> DataFormat;

    /// Hardware channel number of a real endpoint, used to seed the
    /// data-channel number for synchronized connections.
    fn hardware_channel(&self, endpoint: EndpointId) -> u16;

    /// Usable octets per word of the buffer behind a local endpoint.
    fn usable_octets(&self, endpoint: EndpointId) -> u16;

    /// Allocate the shared buffer for the edge and attach both endpoint
    /// halves to it.
    fn connect_buffer(&mut self, source: EndpointId, sink: EndpointId, size: usize)
        -> Result<Buffer>;

    /// Finalize a transform between two endpoints hosted or proxied here.
    fn connect_local(&mut self, source: EndpointId, sink: EndpointId, id: TransformId) -> Status;

    /// Tear down transforms that live entirely on this core. Returns how
    /// many of the ids were actually disconnected.
    fn disconnect_local(&mut self, ids: &[TransformId]) -> usize;

    /// Escalate a condition that a failure status cannot express.
    fn report_fault(&mut self, fault: Fault, detail: u16);
}

/// Outbound side of the control transport to the peer core.
pub trait MessageSender {
    fn send(&mut self, message: corelink_msg::Message) -> std::result::Result<(), SendError>;
}
