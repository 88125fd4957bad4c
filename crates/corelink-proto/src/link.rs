//! Per-link protocol engine.
//!
//! A [`Link`] owns one side of the control conversation between two
//! cores. At most one multi-step sequence (a connect or a disconnect)
//! is in flight at a time; the current sequence lives in a tagged
//! state so every inbound message and channel event is checked against
//! what the link is actually doing. Messages that do not fit the
//! current state are answered with a failure or dropped with a log
//! line; forged identifiers are escalated through the fault hook.
//!
//! The connect sequence runs create-endpoints, channel activation and
//! the final connect exchange. Which side performs which step follows
//! from the [`Role`]: the side whose sink is remote owns the shared
//! buffer and the write channel. Failures after remote resources exist
//! roll back best-effort in reverse creation order; disconnects are
//! monotonic and never rolled back.

use std::mem;

use tracing::{debug, warn};

use corelink_msg::{
    BufferFlags, ChannelDirection, ChannelId, DataFormat, EndpointId, Message, Role, Status,
    TransformId, META_CHANNEL_NUM,
};

use crate::endpoint::{local_kind, EndpointKind, EndpointRegistry};
use crate::error::{ProtoError, Result};
use crate::ipc::{
    Buffer, ChannelManager, CoreId, EndpointHost, EndpointProperty, Fault, MessageSender,
    METADATA_BUFFER_SIZE,
};
use crate::transform::{Transform, TransformRegistry};

/// Highest transform id handed out before the counter wraps.
const MAX_TRANSFORM_ID: u16 = 0x00FF;

/// Completion callback of a connect sequence. The transform id is
/// `TransformId::NONE` unless the status is `Ok`.
pub type ConnectCallback = Box<dyn FnOnce(Status, TransformId)>;

/// Completion callback of a disconnect sequence: final status and how
/// many of the requested transforms went away.
pub type DisconnectCallback = Box<dyn FnOnce(Status, usize)>;

/// Which phase of the connect sequence the link is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStep {
    CreateEndpoints,
    ActivateChannels,
    Connect,
}

/// Everything a connect sequence accumulates across its steps.
struct ConnectCtx {
    step: ConnectStep,
    role: Role,
    /// True on the core that started the sequence.
    initiated: bool,
    source: EndpointId,
    sink: EndpointId,
    data_channel: ChannelId,
    meta_channel: ChannelId,
    /// The metadata companion already serves another transform on the
    /// same port; it must survive this sequence's rollback.
    meta_shared: bool,
    data_active: bool,
    meta_active: bool,
    transform_id: TransformId,
    buffer_size: usize,
    supports_metadata: bool,
    data_format: DataFormat,
    sync: bool,
    on_done: Option<ConnectCallback>,
}

impl ConnectCtx {
    /// The endpoint hosted on this core.
    fn local_endpoint(&self) -> EndpointId {
        match self.role {
            Role::RemoteSink => self.source,
            _ => self.sink,
        }
    }

    /// The proxy for the endpoint hosted on the peer.
    fn shadow_endpoint(&self) -> EndpointId {
        match self.role {
            Role::RemoteSink => self.sink,
            _ => self.source,
        }
    }
}

/// A disconnect sequence waiting for the peer's answer.
struct DisconnectCtx {
    /// Cross-core ids forwarded to the peer, in request order.
    remote: Vec<TransformId>,
    /// Transforms already gone: no-op entries plus local teardowns.
    success: usize,
    on_done: Option<DisconnectCallback>,
}

#[derive(Default)]
enum ProtocolState {
    #[default]
    Idle,
    Connecting(ConnectCtx),
    Disconnecting(DisconnectCtx),
    /// A single-transform teardown driven by endpoint destruction; the
    /// local side is already gone, only the peer's answer is pending.
    DisconnectingEndpoint,
}

impl ProtocolState {
    fn name(&self) -> &'static str {
        match self {
            ProtocolState::Idle => "idle",
            ProtocolState::Connecting(_) => "connecting",
            ProtocolState::Disconnecting(_) => "disconnecting",
            ProtocolState::DisconnectingEndpoint => "disconnecting_endpoint",
        }
    }
}

/// One side of the control conversation with a peer core.
pub struct Link<C, H, S> {
    peer: CoreId,
    state: ProtocolState,
    endpoints: EndpointRegistry,
    transforms: TransformRegistry,
    channels: C,
    host: H,
    sender: S,
    next_transform_id: u16,
}

impl<C, H, S> Link<C, H, S>
where
    C: ChannelManager,
    H: EndpointHost,
    S: MessageSender,
{
    pub fn new(peer: CoreId, channels: C, host: H, sender: S) -> Self {
        Link {
            peer,
            state: ProtocolState::Idle,
            endpoints: EndpointRegistry::new(),
            transforms: TransformRegistry::new(),
            channels,
            host,
            sender,
            next_transform_id: 1,
        }
    }

    pub fn peer(&self) -> CoreId {
        self.peer
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ProtocolState::Idle)
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// The cross-core transform touching `endpoint`, if any.
    pub fn transform_for_endpoint(&self, endpoint: EndpointId) -> Option<&Transform> {
        self.transforms.find_by_endpoint(endpoint)
    }

    /// The endpoint on the far side of the edge through `endpoint`.
    pub fn endpoint_connected_to(&self, endpoint: EndpointId) -> Option<EndpointId> {
        self.transforms
            .find_by_endpoint(endpoint)
            .map(|t| t.other_end(endpoint))
    }

    /// Start a connect sequence between `source` and `sink`. Shadow
    /// markers on the ids must agree with `role`; `data_format` is what
    /// the local endpoint produces or expects (the buffer-owning side's
    /// producer format wins during negotiation). Completion, success
    /// or failure, arrives through `on_done` once the peer has
    /// answered; only sequences that cannot start at all return an
    /// error here.
    pub fn connect(
        &mut self,
        source: EndpointId,
        sink: EndpointId,
        role: Role,
        data_format: DataFormat,
        sync: bool,
        on_done: ConnectCallback,
    ) -> Result<()> {
        if !self.is_idle() {
            return Err(ProtoError::StateConflict("connect"));
        }
        if !source.is_well_formed() || !source.is_source() {
            return Err(ProtoError::Validation("malformed source id"));
        }
        if !sink.is_well_formed() || !sink.is_sink() {
            return Err(ProtoError::Validation("malformed sink id"));
        }
        let shadow_ok = match role {
            Role::RemoteSink => sink.is_shadow() && !source.is_shadow(),
            Role::RemoteSource => source.is_shadow() && !sink.is_shadow(),
            Role::BothRemote => source.is_shadow() && sink.is_shadow(),
        };
        if !shadow_ok {
            return Err(ProtoError::Validation("role does not match shadow markers"));
        }
        debug!(%source, %sink, ?role, sync, "starting connect");

        if role == Role::BothRemote {
            return self.connect_both_remote(source, sink, sync, on_done);
        }

        let mut ctx = ConnectCtx {
            step: ConnectStep::CreateEndpoints,
            role,
            initiated: true,
            source,
            sink,
            data_channel: ChannelId::NONE,
            meta_channel: ChannelId::NONE,
            meta_shared: false,
            data_active: false,
            meta_active: false,
            transform_id: TransformId::NONE,
            buffer_size: 0,
            supports_metadata: false,
            data_format,
            sync,
            on_done: Some(on_done),
        };
        self.create_connect_resources(&mut ctx)?;

        let local = ctx.local_endpoint();
        let details = match self.host.buffer_details(local) {
            Ok(details) => details,
            Err(err) => {
                self.destroy_connect_resources(&ctx);
                return Err(err);
            }
        };
        ctx.buffer_size = details.size;
        ctx.supports_metadata = details.supports_metadata;
        let shadow = ctx.shadow_endpoint();
        if let Err(err) = self
            .host
            .configure(shadow, EndpointProperty::MetadataSupport(ctx.supports_metadata))
        {
            self.destroy_connect_resources(&ctx);
            return Err(err);
        }

        // A channel bound to a port is named from the peer's side; a
        // bare number proposal travels as-is.
        let proposed = if ctx.data_channel.port() == 0 {
            ctx.data_channel
        } else {
            ctx.data_channel.inverted()
        };
        let msg = Message::CreateEndpointsReq {
            source_id: source.base(),
            sink_id: sink.base(),
            channel_id: proposed,
            buffer_size: ctx.buffer_size,
            flags: BufferFlags {
                supports_metadata: ctx.supports_metadata,
                remote_role: role,
            },
            data_format: ctx.data_format,
            sync,
        };
        if let Err(err) = self.sender.send(msg) {
            self.destroy_connect_resources(&ctx);
            return Err(ProtoError::Transport(err.to_string()));
        }
        self.state = ProtocolState::Connecting(ctx);
        Ok(())
    }

    /// Forward a connect whose endpoints both live on the peer core.
    /// No local resources are needed; the peer does the whole job.
    fn connect_both_remote(
        &mut self,
        source: EndpointId,
        sink: EndpointId,
        sync: bool,
        on_done: ConnectCallback,
    ) -> Result<()> {
        let id = self
            .allocate_transform_id()
            .ok_or(ProtoError::ResourceExhausted("transform"))?;
        self.transforms.add(Transform {
            id,
            source,
            sink,
            data_channel: ChannelId::NONE,
            meta_channel: ChannelId::NONE,
            remote_core: self.peer,
            enabled: false,
        })?;
        let msg = Message::ConnectReq {
            source_id: source.base(),
            sink_id: sink.base(),
            transform_id: id,
            channel_id: ChannelId::NONE,
        };
        if let Err(err) = self.sender.send(msg) {
            self.transforms.remove(id);
            return Err(ProtoError::Transport(err.to_string()));
        }
        self.state = ProtocolState::Connecting(ConnectCtx {
            step: ConnectStep::Connect,
            role: Role::BothRemote,
            initiated: true,
            source,
            sink,
            data_channel: ChannelId::NONE,
            meta_channel: ChannelId::NONE,
            meta_shared: false,
            data_active: false,
            meta_active: false,
            transform_id: id,
            buffer_size: 0,
            supports_metadata: false,
            data_format: DataFormat::Pcm32,
            sync,
            on_done: Some(on_done),
        });
        Ok(())
    }

    /// Tear down a batch of transforms. No-op entries (id 0, ids named
    /// twice) count as satisfied. Purely local transforms go down
    /// synchronously; cross-core ones are forwarded to the peer in one
    /// request. The result is monotonic: whatever was torn down stays
    /// torn down even when the sequence fails part way.
    pub fn disconnect(&mut self, ids: &[TransformId], on_done: DisconnectCallback) -> Result<()> {
        if !self.is_idle() {
            return Err(ProtoError::StateConflict("disconnect"));
        }
        if ids.is_empty() {
            return Err(ProtoError::Validation("no transforms named"));
        }
        let mut success = 0usize;
        let mut local: Vec<TransformId> = Vec::new();
        let mut remote: Vec<TransformId> = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            if id.is_none() || ids[..i].contains(&id) {
                success += 1;
            } else if self.transforms.find_by_id(id).is_some() {
                remote.push(id);
            } else {
                local.push(id);
            }
        }
        if !local.is_empty() {
            success += self.host.disconnect_local(&local);
        }
        if remote.is_empty() {
            let status = if success > 0 { Status::Ok } else { Status::CmdFailed };
            on_done(status, success);
            return Ok(());
        }
        for &id in &remote {
            if let Some(t) = self.transforms.find_by_id_mut(id) {
                t.enabled = false;
            }
        }
        debug!(count = remote.len(), "forwarding disconnect to peer");
        let msg = Message::TransformDisconnectReq {
            count: remote.len(),
            transform_ids: remote.clone(),
        };
        if let Err(err) = self.sender.send(msg) {
            warn!(error = %err, "disconnect request could not be sent");
            on_done(Status::CmdFailed, success);
            return Ok(());
        }
        self.state = ProtocolState::Disconnecting(DisconnectCtx {
            remote,
            success,
            on_done: Some(on_done),
        });
        Ok(())
    }

    /// Tear down the cross-core transform touching `endpoint`, if one
    /// exists, as part of destroying the endpoint itself. The local
    /// half goes down immediately; the peer's answer closes the
    /// sequence. Returns whether a transform was found.
    pub fn disconnect_endpoint(&mut self, endpoint: EndpointId) -> Result<bool> {
        let id = match self.transforms.find_by_endpoint(endpoint) {
            Some(t) => t.id,
            None => return Ok(false),
        };
        if !self.is_idle() {
            return Err(ProtoError::StateConflict("disconnect_endpoint"));
        }
        if let Some(t) = self.transforms.find_by_id_mut(id) {
            t.enabled = false;
        }
        let msg = Message::TransformDisconnectReq {
            count: 1,
            transform_ids: vec![id],
        };
        self.sender
            .send(msg)
            .map_err(|e| ProtoError::Transport(e.to_string()))?;
        self.teardown_transform(id);
        self.state = ProtocolState::DisconnectingEndpoint;
        Ok(true)
    }

    /// Drop the local entry for a transform the peer cleaned up on its
    /// own (its endpoint died mid-sequence) and tell the peer to drop
    /// its mirror entry.
    pub fn cleanup_endpoint_transform(&mut self, id: TransformId) -> Result<()> {
        self.transforms.remove(id);
        self.sender
            .send(Message::TransformListRemoveEntryReq {
                count: 1,
                transform_ids: vec![id],
            })
            .map_err(|e| ProtoError::Transport(e.to_string()))
    }

    /// Forget an endpoint entirely: abort any connect sequence that
    /// references it, tear down its transforms and drop it from the
    /// registry.
    pub fn destroy_endpoint(&mut self, endpoint: EndpointId) {
        if let ProtocolState::Connecting(ctx) = &self.state {
            if ctx.source == endpoint || ctx.sink == endpoint {
                if let ProtocolState::Connecting(ctx) = mem::take(&mut self.state) {
                    debug!(%endpoint, "aborting connect for destroyed endpoint");
                    self.abort_connect(ctx);
                }
            }
        }
        while let Some(id) = self.transforms.find_by_endpoint(endpoint).map(|t| t.id) {
            self.teardown_transform(id);
        }
        self.endpoints.destroy(endpoint);
    }

    /// Decode and dispatch one inbound control payload.
    pub fn on_payload(&mut self, payload: &[u8]) -> Result<()> {
        let message = corelink_msg::decode_message(payload)?;
        self.on_message(message);
        Ok(())
    }

    /// Dispatch one inbound control message.
    pub fn on_message(&mut self, message: Message) {
        debug!(kind = message.kind(), state = self.state.name(), "inbound message");
        match message {
            Message::CreateEndpointsReq {
                source_id,
                sink_id,
                channel_id,
                buffer_size,
                flags,
                data_format,
                sync,
            } => self.on_create_endpoints_req(
                source_id,
                sink_id,
                channel_id,
                buffer_size,
                flags,
                data_format,
                sync,
            ),
            Message::CreateEndpointsRes {
                status,
                channel_id,
                buffer_size,
                flags,
                data_format,
            } => self.on_create_endpoints_res(status, channel_id, buffer_size, flags, data_format),
            Message::ConnectReq {
                source_id,
                sink_id,
                transform_id,
                channel_id,
            } => self.on_connect_req(source_id, sink_id, transform_id, channel_id),
            Message::ConnectRes {
                status,
                transform_id,
            } => self.on_connect_res(status, transform_id),
            Message::TransformDisconnectReq {
                count,
                transform_ids,
            } => self.on_transform_disconnect_req(count, transform_ids),
            Message::TransformDisconnectRes { status, count } => {
                self.on_transform_disconnect_res(status, count)
            }
            Message::DestroyEndpointsReq { source_id, sink_id } => {
                self.on_destroy_endpoints_req(source_id, sink_id)
            }
            Message::DestroyEndpointsRes { status } => self.on_destroy_endpoints_res(status),
            Message::TransformListRemoveEntryReq {
                count,
                transform_ids,
            } => self.on_transform_list_remove_entry_req(count, transform_ids),
            Message::TransformListRemoveEntryRes { status, count } => {
                if !status.is_ok() {
                    warn!(?status, count, "peer failed to drop transform entries");
                }
            }
            Message::MetadataChannelActivatedReq { channel_id } => {
                self.on_metadata_channel_activated_req(channel_id)
            }
            Message::MetadataChannelActivatedRes { status, channel_id } => {
                self.on_channel_activated(status, channel_id)
            }
            Message::ConnectConfirmReq { connected_to_id } => {
                self.on_connect_confirm_req(connected_to_id)
            }
        }
    }

    /// Channel manager event: a data or metadata channel finished
    /// activating (locally requested or driven by the peer side).
    pub fn on_channel_activated(&mut self, status: Status, channel: ChannelId) {
        let mut ctx = match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx) => ctx,
            other => {
                warn!(%channel, state = other.name(), "channel event with no connect in flight");
                self.host
                    .report_fault(Fault::UnexpectedChannelEvent, channel.0);
                self.state = other;
                return;
            }
        };
        let is_meta = channel.is_metadata();
        let shadow = ctx.shadow_endpoint();
        if !self.endpoints.contains(shadow) {
            self.host.report_fault(Fault::MissingEndpoint, shadow.0);
            self.state = ProtocolState::Connecting(ctx);
            return;
        }
        let mut status = status;
        if status.is_ok() {
            let prop = if is_meta {
                EndpointProperty::MetadataChannelId(channel)
            } else {
                EndpointProperty::DataChannel(channel)
            };
            if self.host.configure(shadow, prop).is_err() {
                status = Status::CmdFailed;
            }
        }

        if ctx.role == Role::RemoteSource {
            // Reader side: the writer owns the sequence and recovery.
            if !status.is_ok() {
                warn!(%channel, "peer-driven channel activation failed");
                self.state = ProtocolState::Connecting(ctx);
                return;
            }
            if is_meta {
                ctx.meta_channel = channel;
                ctx.meta_active = true;
            } else {
                ctx.data_channel = channel;
                ctx.data_active = true;
                let _ = self
                    .host
                    .configure(ctx.source, EndpointProperty::CloneRemoteBuffer(true));
                if let Err(err) = self.host.connect_buffer(ctx.source, ctx.sink, ctx.buffer_size)
                {
                    warn!(error = %err, "attaching remote buffer failed");
                }
            }
            self.state = ProtocolState::Connecting(ctx);
            return;
        }

        // Writer side owns the buffer, the channels and recovery.
        if !status.is_ok() {
            warn!(%channel, is_meta, "channel activation failed");
            if ctx.initiated {
                self.start_rollback(ctx);
            } else {
                let _ = self.send_create_endpoints_res(&ctx, Status::CmdFailed);
                self.destroy_connect_resources(&ctx);
            }
            return;
        }
        if is_meta {
            ctx.meta_active = true;
        } else {
            ctx.data_active = true;
        }
        let complete = ctx.data_active && (!ctx.supports_metadata || ctx.meta_active);
        if !complete {
            self.state = ProtocolState::Connecting(ctx);
            return;
        }
        if ctx.initiated {
            if self.send_connect_req(&mut ctx) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                self.start_rollback(ctx);
            }
        } else {
            ctx.step = ConnectStep::Connect;
            if self.send_create_endpoints_res(&ctx, Status::Ok) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                self.destroy_connect_resources(&ctx);
            }
        }
    }

    /// Channel manager event: a channel went down. Data stops flowing
    /// on the owning transform; teardown proper arrives separately.
    pub fn on_channel_deactivated(&mut self, status: Status, channel: ChannelId) {
        debug!(%channel, ?status, "channel deactivated");
        if !status.is_ok() {
            return;
        }
        if let Some(id) = self.transforms.find_by_channel(channel).map(|t| t.id) {
            if let Some(t) = self.transforms.find_by_id_mut(id) {
                t.enabled = false;
            }
        }
    }

    fn on_create_endpoints_req(
        &mut self,
        source_id: EndpointId,
        sink_id: EndpointId,
        channel_id: ChannelId,
        buffer_size: usize,
        flags: BufferFlags,
        data_format: DataFormat,
        sync: bool,
    ) {
        let role = flags.remote_role.mirrored();
        if role == Role::BothRemote {
            let _ = self.sender.send(Message::CreateEndpointsRes {
                status: Status::CmdFailed,
                channel_id: ChannelId::NONE,
                buffer_size: 0,
                flags,
                data_format,
            });
            return;
        }
        let (source, sink) = match role {
            Role::RemoteSource => (source_id.shadow(), sink_id),
            _ => (source_id, sink_id.shadow()),
        };
        let mut ctx = ConnectCtx {
            step: ConnectStep::CreateEndpoints,
            role,
            initiated: false,
            source,
            sink,
            data_channel: channel_id,
            meta_channel: ChannelId::NONE,
            meta_shared: false,
            data_active: false,
            meta_active: false,
            transform_id: TransformId::NONE,
            buffer_size,
            supports_metadata: flags.supports_metadata,
            data_format,
            sync,
            on_done: None,
        };
        if !self.is_idle() {
            debug!(state = self.state.name(), "rejecting endpoint creation while busy");
            let _ = self.send_create_endpoints_res(&ctx, Status::CmdFailed);
            return;
        }
        let well_formed = source_id.is_well_formed()
            && source_id.is_source()
            && sink_id.is_well_formed()
            && sink_id.is_sink();
        if !well_formed {
            debug!(%source_id, %sink_id, "rejecting malformed endpoint ids");
            let _ = self.send_create_endpoints_res(&ctx, Status::InvalidParams);
            return;
        }
        if let Err(err) = self.create_connect_resources(&mut ctx) {
            debug!(error = %err, "endpoint creation for peer failed");
            let _ = self.send_create_endpoints_res(&ctx, Status::CmdFailed);
            return;
        }

        // Fold this side's buffer requirements into the request's.
        let local = ctx.local_endpoint();
        let details = match self.host.buffer_details(local) {
            Ok(details) => details,
            Err(_) => {
                self.destroy_connect_resources(&ctx);
                let _ = self.send_create_endpoints_res(&ctx, Status::CmdFailed);
                return;
            }
        };
        if details.size > ctx.buffer_size {
            ctx.buffer_size = details.size;
        }
        ctx.supports_metadata = ctx.supports_metadata && details.supports_metadata;
        let shadow = ctx.shadow_endpoint();
        if self
            .host
            .configure(shadow, EndpointProperty::MetadataSupport(ctx.supports_metadata))
            .is_err()
        {
            ctx.supports_metadata = false;
        }

        if ctx.role == Role::RemoteSource {
            // The peer owns the buffer; accept now, activation events
            // arrive once the peer brings the channels up.
            let _ = self
                .host
                .configure(shadow, EndpointProperty::DataFormat(ctx.data_format));
            ctx.step = ConnectStep::Connect;
            if self.send_create_endpoints_res(&ctx, Status::Ok) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                self.destroy_connect_resources(&ctx);
            }
        } else {
            // This side owns the buffer: bring the channels up first,
            // the response goes out when activation completes.
            ctx.data_format = self.host.data_format(local);
            let _ = self
                .host
                .configure(shadow, EndpointProperty::DataFormat(ctx.data_format));
            ctx.step = ConnectStep::ActivateChannels;
            if self.activate_connect_channels(&mut ctx) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                let _ = self.send_create_endpoints_res(&ctx, Status::CmdFailed);
                self.destroy_connect_resources(&ctx);
            }
        }
    }

    fn on_create_endpoints_res(
        &mut self,
        status: Status,
        channel_id: ChannelId,
        buffer_size: usize,
        flags: BufferFlags,
        data_format: DataFormat,
    ) {
        let mut ctx = match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx)
                if ctx.initiated && ctx.step == ConnectStep::CreateEndpoints =>
            {
                ctx
            }
            other => {
                debug!(state = other.name(), "unexpected create_endpoints_res");
                self.state = other;
                return;
            }
        };
        let channel_ok = !channel_id.is_none()
            && (ctx.data_channel.port() == 0 || channel_id.inverted() == ctx.data_channel);
        if !status.is_ok() || !channel_ok {
            debug!(?status, %channel_id, "peer rejected endpoint creation");
            self.destroy_connect_resources(&ctx);
            self.finish_connect(ctx, Status::CmdFailed);
            return;
        }
        ctx.buffer_size = buffer_size;
        ctx.supports_metadata = flags.supports_metadata;
        if ctx.role == Role::RemoteSink {
            ctx.step = ConnectStep::ActivateChannels;
            if self.activate_connect_channels(&mut ctx) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                self.start_rollback(ctx);
            }
        } else {
            // Adopt the channel the owning side bound.
            ctx.data_channel = channel_id.inverted();
            ctx.data_format = data_format;
            let shadow = ctx.shadow_endpoint();
            let _ = self
                .host
                .configure(shadow, EndpointProperty::DataFormat(data_format));
            if self.send_connect_req(&mut ctx) {
                self.state = ProtocolState::Connecting(ctx);
            } else {
                self.start_rollback(ctx);
            }
        }
    }

    fn on_connect_req(
        &mut self,
        source_id: EndpointId,
        sink_id: EndpointId,
        transform_id: TransformId,
        channel_id: ChannelId,
    ) {
        if transform_id.is_none() {
            let _ = self.sender.send(Message::ConnectRes {
                status: Status::InvalidParams,
                transform_id,
            });
            return;
        }
        if channel_id.is_none() {
            // Both endpoints live on this core; connect them directly.
            let status = if self.is_idle()
                && source_id.is_well_formed()
                && source_id.is_source()
                && sink_id.is_well_formed()
                && sink_id.is_sink()
            {
                self.host.connect_local(source_id, sink_id, transform_id)
            } else {
                Status::CmdFailed
            };
            let _ = self.sender.send(Message::ConnectRes {
                status,
                transform_id,
            });
            return;
        }
        let ctx = match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx)
                if !ctx.initiated
                    && ctx.source.base() == source_id
                    && ctx.sink.base() == sink_id =>
            {
                ctx
            }
            other => {
                debug!(state = other.name(), "unexpected connect_req");
                self.state = other;
                let _ = self.sender.send(Message::ConnectRes {
                    status: Status::CmdFailed,
                    transform_id,
                });
                return;
            }
        };
        let channel_ok = channel_id == ctx.data_channel || ctx.data_channel.port() == 0;
        if !channel_ok {
            let _ = self.sender.send(Message::ConnectRes {
                status: Status::CmdFailed,
                transform_id,
            });
            self.state = ProtocolState::Connecting(ctx);
            return;
        }
        let entry = Transform {
            id: transform_id,
            source: ctx.source,
            sink: ctx.sink,
            data_channel: ctx.data_channel,
            meta_channel: ctx.meta_channel,
            remote_core: self.peer,
            enabled: false,
        };
        if self.transforms.add(entry).is_err() {
            let _ = self.sender.send(Message::ConnectRes {
                status: Status::CmdFailed,
                transform_id,
            });
            self.destroy_connect_resources(&ctx);
            return;
        }
        let status = self.host.connect_local(ctx.source, ctx.sink, transform_id);
        if status.is_ok() {
            if let Some(t) = self.transforms.find_by_id_mut(transform_id) {
                t.enabled = true;
            }
            self.sync_usable_octets(&ctx);
        } else {
            self.transforms.remove(transform_id);
            self.destroy_connect_resources(&ctx);
        }
        let _ = self.sender.send(Message::ConnectRes {
            status,
            transform_id,
        });
    }

    fn on_connect_res(&mut self, status: Status, transform_id: TransformId) {
        let ctx = match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx) if ctx.initiated && ctx.step == ConnectStep::Connect => {
                ctx
            }
            other => {
                debug!(state = other.name(), "unexpected connect_res");
                self.state = other;
                return;
            }
        };
        let mut status = status;
        if status.is_ok() && transform_id != ctx.transform_id {
            warn!(%transform_id, expected = %ctx.transform_id, "peer confirmed a transform this side never offered");
            self.host
                .report_fault(Fault::TransformIdMismatch, transform_id.0);
            status = Status::CmdFailed;
        }
        if ctx.role == Role::BothRemote {
            if status.is_ok() {
                if let Some(t) = self.transforms.find_by_id_mut(ctx.transform_id) {
                    t.enabled = true;
                }
            } else {
                self.transforms.remove(ctx.transform_id);
            }
            self.finish_connect(ctx, status);
            return;
        }
        if !status.is_ok() {
            self.fail_connect(ctx);
            return;
        }
        if let Some(t) = self.transforms.find_by_id_mut(ctx.transform_id) {
            t.enabled = true;
        }
        let local_status = self.host.connect_local(ctx.source, ctx.sink, ctx.transform_id);
        if !local_status.is_ok() {
            // The peer is already connected; ask it to undo before the
            // local rollback. Its answer closes the sequence.
            if let Some(t) = self.transforms.find_by_id_mut(ctx.transform_id) {
                t.enabled = false;
            }
            let msg = Message::TransformDisconnectReq {
                count: 1,
                transform_ids: vec![ctx.transform_id],
            };
            match self.sender.send(msg) {
                Ok(()) => self.state = ProtocolState::Connecting(ctx),
                Err(err) => {
                    warn!(error = %err, "connect unwind could not be sent");
                    self.fail_connect(ctx);
                }
            }
            return;
        }
        self.sync_usable_octets(&ctx);
        let local = ctx.local_endpoint();
        if let Err(err) = self.sender.send(Message::ConnectConfirmReq {
            connected_to_id: local.base(),
        }) {
            debug!(error = %err, "connect confirm could not be sent");
        }
        self.finish_connect(ctx, Status::Ok);
    }

    fn on_transform_disconnect_req(&mut self, count: usize, ids: Vec<TransformId>) {
        if !self.is_idle() || count == 0 {
            let _ = self.sender.send(Message::TransformDisconnectRes {
                status: Status::CmdFailed,
                count: 0,
            });
            return;
        }
        let mut done = 0;
        for id in ids {
            done += self.teardown_transform(id);
        }
        let status = if done > 0 { Status::Ok } else { Status::CmdFailed };
        let _ = self
            .sender
            .send(Message::TransformDisconnectRes { status, count: done });
    }

    fn on_transform_disconnect_res(&mut self, status: Status, count: usize) {
        match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx) => {
                // Unwind of a connect whose local finalize failed.
                self.fail_connect(ctx);
            }
            ProtocolState::Disconnecting(mut d) => {
                let confirmed = count.min(d.remote.len());
                if count > d.remote.len() {
                    warn!(count, requested = d.remote.len(), "peer disconnected more than asked");
                    self.host
                        .report_fault(Fault::DisconnectInconsistent, count as u16);
                }
                for &id in &d.remote[..confirmed] {
                    self.teardown_transform(id);
                }
                d.success += confirmed;
                let final_status = if status.is_ok() && d.success == 0 {
                    Status::CmdFailed
                } else {
                    status
                };
                if let Some(cb) = d.on_done.take() {
                    cb(final_status, d.success);
                }
            }
            ProtocolState::DisconnectingEndpoint => {
                if !status.is_ok() {
                    warn!(?status, "peer failed endpoint-driven disconnect");
                }
            }
            ProtocolState::Idle => {
                debug!("unexpected transform_disconnect_res");
            }
        }
    }

    fn on_destroy_endpoints_req(&mut self, source_id: EndpointId, sink_id: EndpointId) {
        let status = match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx) if !ctx.initiated => {
                let matched = ctx.source.base() == source_id && ctx.sink.base() == sink_id;
                self.destroy_connect_resources(&ctx);
                if matched {
                    Status::Ok
                } else {
                    warn!(%source_id, %sink_id, "destroy request for a different endpoint pair");
                    Status::CmdFailed
                }
            }
            other => {
                self.state = other;
                Status::CmdFailed
            }
        };
        let _ = self.sender.send(Message::DestroyEndpointsRes { status });
    }

    fn on_destroy_endpoints_res(&mut self, status: Status) {
        if !status.is_ok() {
            // The peer kept resources this side asked it to drop; that
            // leaks until the next teardown and is worth escalating.
            self.host.report_fault(Fault::EndpointDestroyFailed, 0);
        }
        match mem::take(&mut self.state) {
            ProtocolState::Connecting(ctx) => {
                self.destroy_connect_resources(&ctx);
                self.finish_connect(ctx, Status::CmdFailed);
            }
            ProtocolState::DisconnectingEndpoint => {
                debug!(?status, "peer finished abort cleanup");
            }
            other => {
                debug!(state = other.name(), "unexpected destroy_endpoints_res");
                self.state = other;
            }
        }
    }

    fn on_transform_list_remove_entry_req(&mut self, count: usize, ids: Vec<TransformId>) {
        if count == 0 {
            let _ = self.sender.send(Message::TransformListRemoveEntryRes {
                status: Status::CmdFailed,
                count: 0,
            });
            return;
        }
        let mut removed = 0;
        for id in ids {
            if self.transforms.remove(id).is_some() {
                removed += 1;
            }
        }
        let _ = self.sender.send(Message::TransformListRemoveEntryRes {
            status: Status::Ok,
            count: removed,
        });
    }

    fn on_metadata_channel_activated_req(&mut self, channel_id: ChannelId) {
        // The companion is already live for another transform on the
        // same port; attach it to the sequence in flight.
        let status = if matches!(self.state, ProtocolState::Connecting(_)) {
            self.on_channel_activated(Status::Ok, channel_id);
            Status::Ok
        } else {
            debug!(%channel_id, "metadata attach with no connect in flight");
            Status::CmdFailed
        };
        let _ = self.sender.send(Message::MetadataChannelActivatedRes {
            status,
            channel_id: channel_id.inverted(),
        });
    }

    fn on_connect_confirm_req(&mut self, connected_to_id: EndpointId) {
        let shadow = connected_to_id.shadow();
        let data_channel = match self.transforms.find_by_endpoint(shadow) {
            Some(t) => t.data_channel,
            None => {
                warn!(endpoint = %connected_to_id, "confirm for an unknown endpoint");
                return;
            }
        };
        if let Some(buffer) = self.channels.buffer_for(data_channel) {
            let _ = self
                .host
                .configure(shadow, EndpointProperty::UsableOctets(buffer.usable_octets));
        }
    }

    fn allocate_transform_id(&mut self) -> Option<TransformId> {
        for _ in 0..MAX_TRANSFORM_ID {
            let id = TransformId(self.next_transform_id);
            self.next_transform_id = if self.next_transform_id >= MAX_TRANSFORM_ID {
                1
            } else {
                self.next_transform_id + 1
            };
            if self.transforms.find_by_id(id).is_none() {
                return Some(id);
            }
        }
        None
    }

    /// Create the data channel (writer side) and both endpoint entries
    /// for a connect sequence. Cleans up after itself on failure.
    fn create_connect_resources(&mut self, ctx: &mut ConnectCtx) -> Result<()> {
        let mut created_channel = false;
        if ctx.role == Role::RemoteSink {
            let number = if !ctx.data_channel.is_none() {
                ctx.data_channel.number()
            } else if ctx.source.is_real() && !ctx.source.is_shadow() {
                self.host.hardware_channel(ctx.source)
            } else {
                ctx.source.terminal()
            };
            // Synchronized edges between the same entities share a port.
            let port = if ctx.sync {
                self.transforms
                    .find_port_peer(ctx.source, ctx.sink)
                    .map(|t| t.data_channel.port())
                    .unwrap_or(0)
            } else {
                0
            };
            ctx.data_channel =
                self.channels
                    .create_channel(port, number, ChannelDirection::Write)?;
            created_channel = true;
        } else if ctx.data_channel.is_none() {
            // Reader side only proposes a channel number.
            let number = if ctx.sink.is_real() && !ctx.sink.is_shadow() {
                self.host.hardware_channel(ctx.sink)
            } else {
                ctx.sink.terminal()
            };
            ctx.data_channel = ChannelId::new(0, number, ChannelDirection::Read);
        }
        let source_kind = if ctx.source.is_shadow() {
            EndpointKind::Shadow
        } else {
            local_kind(ctx.source)
        };
        let sink_kind = if ctx.sink.is_shadow() {
            EndpointKind::Shadow
        } else {
            local_kind(ctx.sink)
        };
        if let Err(err) = self
            .endpoints
            .create(ctx.source, source_kind)
            .and_then(|_| self.endpoints.create(ctx.sink, sink_kind))
        {
            self.endpoints.destroy(ctx.source);
            if created_channel {
                self.channels.destroy_channel(ctx.data_channel);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Undo everything a connect sequence created, in reverse order.
    fn destroy_connect_resources(&mut self, ctx: &ConnectCtx) {
        self.endpoints.destroy(ctx.sink);
        self.endpoints.destroy(ctx.source);
        if ctx.role == Role::RemoteSink {
            if !ctx.meta_channel.is_none() && !ctx.meta_shared {
                self.channels.deactivate_channel(ctx.meta_channel);
                self.channels.destroy_channel(ctx.meta_channel);
            }
            if !ctx.data_channel.is_none() {
                self.channels.deactivate_channel(ctx.data_channel);
                self.channels.destroy_channel(ctx.data_channel);
            }
        }
        if !ctx.transform_id.is_none() {
            self.transforms.remove(ctx.transform_id);
        }
    }

    /// Allocate the shared buffer and bring the data channel (and the
    /// metadata companion, when both sides support it) up. Activation
    /// completion arrives through [`Link::on_channel_activated`].
    fn activate_connect_channels(&mut self, ctx: &mut ConnectCtx) -> bool {
        let shadow = ctx.shadow_endpoint();
        if self
            .host
            .configure(shadow, EndpointProperty::ShadowBufferSize(ctx.buffer_size))
            .is_err()
        {
            return false;
        }
        let buffer = match self.host.connect_buffer(ctx.source, ctx.sink, ctx.buffer_size) {
            Ok(buffer) => buffer,
            Err(err) => {
                debug!(error = %err, "shared buffer allocation failed");
                return false;
            }
        };
        // Activation may complete inline or through a later event.
        let accepted = matches!(
            self.channels
                .activate_channel(ctx.data_channel, self.peer, buffer, true),
            Status::Ok | Status::Pending
        );
        if !accepted {
            return false;
        }
        if ctx.supports_metadata && !self.set_up_metadata_channel(ctx) {
            // Metadata is best effort; fall back to a plain connection.
            warn!(channel = %ctx.data_channel, "metadata channel setup failed, continuing without");
            ctx.supports_metadata = false;
            let _ = self
                .host
                .configure(shadow, EndpointProperty::MetadataSupport(false));
        }
        true
    }

    fn set_up_metadata_channel(&mut self, ctx: &mut ConnectCtx) -> bool {
        if ctx.sync {
            if let Some(peer_entry) = self.transforms.find_port_peer(ctx.source, ctx.sink) {
                if !peer_entry.meta_channel.is_none() {
                    // The companion for this port is already live on both
                    // sides; ask the peer to attach it to the new endpoints.
                    ctx.meta_channel = peer_entry.meta_channel;
                    ctx.meta_shared = true;
                    return self
                        .sender
                        .send(Message::MetadataChannelActivatedReq {
                            channel_id: ctx.meta_channel.inverted(),
                        })
                        .is_ok();
                }
            }
        }
        let meta = match self.channels.create_channel(
            ctx.data_channel.port(),
            META_CHANNEL_NUM,
            ChannelDirection::Write,
        ) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        ctx.meta_channel = meta;
        let accepted = matches!(
            self.channels
                .activate_channel(meta, self.peer, Buffer::new(METADATA_BUFFER_SIZE), false),
            Status::Ok | Status::Pending
        );
        if !accepted {
            self.channels.destroy_channel(meta);
            ctx.meta_channel = ChannelId::NONE;
            return false;
        }
        true
    }

    fn send_create_endpoints_res(&mut self, ctx: &ConnectCtx, status: Status) -> bool {
        let msg = if status.is_ok() {
            Message::CreateEndpointsRes {
                status,
                channel_id: ctx.data_channel,
                buffer_size: ctx.buffer_size,
                flags: BufferFlags {
                    supports_metadata: ctx.supports_metadata,
                    remote_role: ctx.role.mirrored(),
                },
                data_format: ctx.data_format,
            }
        } else {
            Message::CreateEndpointsRes {
                status,
                channel_id: ChannelId::NONE,
                buffer_size: 0,
                flags: BufferFlags {
                    supports_metadata: false,
                    remote_role: ctx.role.mirrored(),
                },
                data_format: ctx.data_format,
            }
        };
        match self.sender.send(msg) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "create_endpoints_res could not be sent");
                false
            }
        }
    }

    fn send_connect_req(&mut self, ctx: &mut ConnectCtx) -> bool {
        let id = match self.allocate_transform_id() {
            Some(id) => id,
            None => return false,
        };
        let entry = Transform {
            id,
            source: ctx.source,
            sink: ctx.sink,
            data_channel: ctx.data_channel,
            meta_channel: ctx.meta_channel,
            remote_core: self.peer,
            enabled: false,
        };
        if self.transforms.add(entry).is_err() {
            return false;
        }
        ctx.transform_id = id;
        ctx.step = ConnectStep::Connect;
        let channel = if ctx.data_channel.is_none() {
            ChannelId::NONE
        } else {
            ctx.data_channel.inverted()
        };
        let msg = Message::ConnectReq {
            source_id: ctx.source.base(),
            sink_id: ctx.sink.base(),
            transform_id: id,
            channel_id: channel,
        };
        match self.sender.send(msg) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "connect_req could not be sent");
                self.transforms.remove(id);
                false
            }
        }
    }

    /// Ask the peer to destroy the endpoints it created for this
    /// sequence. Its answer closes the sequence; when the request
    /// cannot even be sent, only the local side is rolled back.
    fn start_rollback(&mut self, ctx: ConnectCtx) {
        let msg = Message::DestroyEndpointsReq {
            source_id: ctx.source.base(),
            sink_id: ctx.sink.base(),
        };
        match self.sender.send(msg) {
            Ok(()) => self.state = ProtocolState::Connecting(ctx),
            Err(err) => {
                warn!(error = %err, "rollback request could not be sent");
                self.destroy_connect_resources(&ctx);
                self.finish_connect(ctx, Status::CmdFailed);
            }
        }
    }

    /// Local teardown of a failed connect, then completion.
    fn fail_connect(&mut self, ctx: ConnectCtx) {
        self.destroy_connect_resources(&ctx);
        self.finish_connect(ctx, Status::CmdFailed);
    }

    /// Abort an in-flight connect whose endpoint is going away. Once
    /// the create request has been sent the peer may already hold
    /// matching resources; ask it to drop them best effort, without
    /// delaying the local teardown for its answer.
    fn abort_connect(&mut self, ctx: ConnectCtx) {
        if ctx.initiated && ctx.role != Role::BothRemote {
            let msg = Message::DestroyEndpointsReq {
                source_id: ctx.source.base(),
                sink_id: ctx.sink.base(),
            };
            match self.sender.send(msg) {
                Ok(()) => self.state = ProtocolState::DisconnectingEndpoint,
                Err(err) => warn!(error = %err, "abort cleanup could not be sent"),
            }
        }
        self.fail_connect(ctx);
    }

    /// Deliver the sequence outcome. The link is idle afterwards; the
    /// caller must have taken the state out already.
    fn finish_connect(&mut self, mut ctx: ConnectCtx, status: Status) {
        let id = if status.is_ok() {
            ctx.transform_id
        } else {
            TransformId::NONE
        };
        debug!(?status, transform = %id, "connect sequence finished");
        if let Some(cb) = ctx.on_done.take() {
            cb(status, id);
        }
    }

    /// Mirror usable-octets bookkeeping between the local endpoint's
    /// buffer and the shared channel buffer, direction depending on
    /// which side produces the data.
    fn sync_usable_octets(&mut self, ctx: &ConnectCtx) {
        match ctx.role {
            Role::RemoteSink => {
                let octets = self.host.usable_octets(ctx.source);
                self.channels.set_usable_octets(ctx.data_channel, octets);
            }
            Role::RemoteSource => {
                if let Some(buffer) = self.channels.buffer_for(ctx.data_channel) {
                    let _ = self.host.configure(
                        ctx.source,
                        EndpointProperty::UsableOctets(buffer.usable_octets),
                    );
                }
            }
            Role::BothRemote => {}
        }
    }

    /// Tear down one transform on this core: channels, registry entry,
    /// endpoint halves, local stream hookup. Ids not in the registry
    /// are handed to the endpoint host as purely local transforms.
    /// Returns how many transforms actually went away.
    fn teardown_transform(&mut self, id: TransformId) -> usize {
        if id.is_none() {
            return 0;
        }
        let entry = match self.transforms.remove(id) {
            Some(entry) => entry,
            None => return self.host.disconnect_local(&[id]),
        };
        debug!(transform = %id, "tearing down transform");
        if !entry.data_channel.is_none()
            && entry.data_channel.direction() == ChannelDirection::Write
        {
            self.channels.deactivate_channel(entry.data_channel);
            self.channels.destroy_channel(entry.data_channel);
        }
        if !entry.meta_channel.is_none()
            && entry.meta_channel.direction() == ChannelDirection::Write
            && self
                .transforms
                .iter()
                .all(|t| t.meta_channel != entry.meta_channel)
        {
            // Last transform on this port using the companion.
            self.channels.deactivate_channel(entry.meta_channel);
            self.channels.destroy_channel(entry.meta_channel);
        }
        self.host.disconnect_local(&[id]);
        self.endpoints.destroy(entry.sink);
        self.endpoints.destroy(entry.source);
        1
    }
}
