//! Protocol message shapes.
//!
//! Requests flow in both directions between the two cores of a link;
//! every request except `ConnectConfirmReq` has a matching response.
//! At most one multi-message sequence is in flight per link, so no
//! correlation ids are needed beyond the message kinds themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::ChannelId;
use crate::endpoint::EndpointId;
use crate::status::Status;

/// Transform identifier, unique per link. 0 means "no transform".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformId(pub u16);

impl TransformId {
    pub const NONE: TransformId = TransformId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformId({})", self.0)
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the connection lives on the peer core, decided once
/// when a connect sequence starts. The side whose *sink* is remote owns
/// the shared buffer and drives data-channel activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    RemoteSource,
    RemoteSink,
    BothRemote,
}

impl Role {
    /// The same sequence as seen from the peer core.
    pub fn mirrored(self) -> Self {
        match self {
            Role::RemoteSource => Role::RemoteSink,
            Role::RemoteSink => Role::RemoteSource,
            Role::BothRemote => Role::BothRemote,
        }
    }
}

/// Sample encoding negotiated for the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Pcm16,
    Pcm24,
    Pcm32,
    Encoded,
}

/// Buffer negotiation flags shared between the cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferFlags {
    /// Both sides must agree before a metadata companion channel is set up.
    pub supports_metadata: bool,
    /// The sender's view of where the remote endpoints are.
    pub remote_role: Role,
}

/// All messages exchanged on a link, tagged for the JSON envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    CreateEndpointsReq {
        source_id: EndpointId,
        sink_id: EndpointId,
        channel_id: ChannelId,
        buffer_size: usize,
        flags: BufferFlags,
        data_format: DataFormat,
        sync: bool,
    },
    CreateEndpointsRes {
        status: Status,
        channel_id: ChannelId,
        buffer_size: usize,
        flags: BufferFlags,
        data_format: DataFormat,
    },
    ConnectReq {
        source_id: EndpointId,
        sink_id: EndpointId,
        transform_id: TransformId,
        channel_id: ChannelId,
    },
    ConnectRes {
        status: Status,
        transform_id: TransformId,
    },
    TransformDisconnectReq {
        count: usize,
        transform_ids: Vec<TransformId>,
    },
    TransformDisconnectRes {
        status: Status,
        count: usize,
    },
    DestroyEndpointsReq {
        source_id: EndpointId,
        sink_id: EndpointId,
    },
    DestroyEndpointsRes {
        status: Status,
    },
    TransformListRemoveEntryReq {
        count: usize,
        transform_ids: Vec<TransformId>,
    },
    TransformListRemoveEntryRes {
        status: Status,
        count: usize,
    },
    MetadataChannelActivatedReq {
        channel_id: ChannelId,
    },
    MetadataChannelActivatedRes {
        status: Status,
        channel_id: ChannelId,
    },
    /// One-way: the finalizing side asks the peer to mirror its buffer
    /// capacity bookkeeping for the endpoint it just connected to.
    ConnectConfirmReq {
        connected_to_id: EndpointId,
    },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CreateEndpointsReq { .. } => "create_endpoints_req",
            Message::CreateEndpointsRes { .. } => "create_endpoints_res",
            Message::ConnectReq { .. } => "connect_req",
            Message::ConnectRes { .. } => "connect_res",
            Message::TransformDisconnectReq { .. } => "transform_disconnect_req",
            Message::TransformDisconnectRes { .. } => "transform_disconnect_res",
            Message::DestroyEndpointsReq { .. } => "destroy_endpoints_req",
            Message::DestroyEndpointsRes { .. } => "destroy_endpoints_res",
            Message::TransformListRemoveEntryReq { .. } => "transform_list_remove_entry_req",
            Message::TransformListRemoveEntryRes { .. } => "transform_list_remove_entry_res",
            Message::MetadataChannelActivatedReq { .. } => "metadata_channel_activated_req",
            Message::MetadataChannelActivatedRes { .. } => "metadata_channel_activated_res",
            Message::ConnectConfirmReq { .. } => "connect_confirm_req",
        }
    }
}
