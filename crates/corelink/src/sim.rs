//! In-memory two-core harness.
//!
//! Runs one protocol engine per simulated core and moves control
//! payloads and channel events between them through a shared bus,
//! the way the inter-processor FIFO and the channel-manager callbacks
//! would on real hardware. Delivery is in order and lossless; the
//! interesting failure modes live in the engines, not the wiring.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, warn};

use corelink_msg::{
    encode_message, ChannelDirection, ChannelId, DataFormat, EndpointId, Message, Status,
    TransformId,
};
use corelink_proto::{
    Buffer, BufferDetails, ChannelManager, CoreId, EndpointHost, EndpointProperty, Fault, Link,
    MessageSender, Result as ProtoResult, SendError,
};

/// One message as it crossed the simulated FIFO.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub from: u8,
    pub kind: &'static str,
}

/// Per-core counters kept by the simulated endpoint hosts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HostStats {
    pub connects: usize,
    pub disconnects: usize,
    pub faults: usize,
}

#[derive(Default)]
struct Bus {
    inboxes: [VecDeque<Vec<u8>>; 2],
    events: [VecDeque<(Status, ChannelId)>; 2],
    buffers: HashMap<u16, Buffer>,
    trace: Vec<TraceEntry>,
}

/// Both directions of a channel share one backing buffer.
fn buffer_key(channel: ChannelId) -> u16 {
    channel.0.min(channel.inverted().0)
}

pub struct SimChannels {
    core: usize,
    bus: Rc<RefCell<Bus>>,
    next_port: u16,
}

impl ChannelManager for SimChannels {
    fn create_channel(
        &mut self,
        port: u16,
        number: u16,
        direction: ChannelDirection,
    ) -> ProtoResult<ChannelId> {
        let port = if port != 0 {
            port
        } else {
            let p = self.next_port;
            self.next_port += 1;
            p
        };
        let id = ChannelId::new(port, number, direction);
        debug!(core = self.core, channel = %id, "channel created");
        Ok(id)
    }

    fn activate_channel(
        &mut self,
        channel: ChannelId,
        _peer: CoreId,
        buffer: Buffer,
        _create_new: bool,
    ) -> Status {
        let mut bus = self.bus.borrow_mut();
        bus.buffers.insert(buffer_key(channel), buffer);
        // Activation completes on both cores, each seeing its own view.
        bus.events[self.core].push_back((Status::Ok, channel));
        bus.events[1 - self.core].push_back((Status::Ok, channel.inverted()));
        Status::Pending
    }

    fn deactivate_channel(&mut self, channel: ChannelId) -> Status {
        debug!(core = self.core, channel = %channel, "channel deactivated");
        Status::Ok
    }

    fn destroy_channel(&mut self, channel: ChannelId) -> Status {
        self.bus.borrow_mut().buffers.remove(&buffer_key(channel));
        Status::Ok
    }

    fn buffer_for(&self, channel: ChannelId) -> Option<Buffer> {
        self.bus.borrow().buffers.get(&buffer_key(channel)).copied()
    }

    fn set_usable_octets(&mut self, channel: ChannelId, octets: u16) {
        if let Some(buffer) = self.bus.borrow_mut().buffers.get_mut(&buffer_key(channel)) {
            buffer.usable_octets = octets;
        }
    }
}

pub struct SimHost {
    core: usize,
    buffer_size: usize,
    supports_metadata: bool,
    stats: Rc<RefCell<[HostStats; 2]>>,
}

impl EndpointHost for SimHost {
    fn buffer_details(&self, _endpoint: EndpointId) -> ProtoResult<BufferDetails> {
        Ok(BufferDetails {
            size: self.buffer_size,
            supports_metadata: self.supports_metadata,
        })
    }

    fn configure(&mut self, endpoint: EndpointId, property: EndpointProperty) -> ProtoResult<()> {
        debug!(core = self.core, %endpoint, ?property, "endpoint configured");
        Ok(())
    }

    fn data_format(&self, _endpoint: EndpointId) -> DataFormat {
        DataFormat::Pcm32
    }

    fn hardware_channel(&self, endpoint: EndpointId) -> u16 {
        endpoint.terminal()
    }

    fn usable_octets(&self, _endpoint: EndpointId) -> u16 {
        4
    }

    fn connect_buffer(
        &mut self,
        _source: EndpointId,
        _sink: EndpointId,
        size: usize,
    ) -> ProtoResult<Buffer> {
        Ok(Buffer::new(size))
    }

    fn connect_local(
        &mut self,
        source: EndpointId,
        sink: EndpointId,
        id: TransformId,
    ) -> Status {
        debug!(core = self.core, %source, %sink, transform = %id, "local connect");
        self.stats.borrow_mut()[self.core].connects += 1;
        Status::Ok
    }

    fn disconnect_local(&mut self, ids: &[TransformId]) -> usize {
        self.stats.borrow_mut()[self.core].disconnects += ids.len();
        ids.len()
    }

    fn report_fault(&mut self, fault: Fault, detail: u16) {
        warn!(core = self.core, ?fault, detail, "fault reported");
        self.stats.borrow_mut()[self.core].faults += 1;
    }
}

pub struct SimSender {
    core: usize,
    bus: Rc<RefCell<Bus>>,
}

impl MessageSender for SimSender {
    fn send(&mut self, message: Message) -> Result<(), SendError> {
        let payload = encode_message(&message).map_err(|e| SendError(e.to_string()))?;
        let mut bus = self.bus.borrow_mut();
        bus.trace.push(TraceEntry {
            from: self.core as u8,
            kind: message.kind(),
        });
        bus.inboxes[1 - self.core].push_back(payload);
        Ok(())
    }
}

pub type SimLink = Link<SimChannels, SimHost, SimSender>;

enum Work {
    Event(usize, Status, ChannelId),
    Payload(usize, Vec<u8>),
}

/// A pair of cores wired back to back.
pub struct CorePair {
    pub p0: SimLink,
    pub p1: SimLink,
    bus: Rc<RefCell<Bus>>,
    stats: Rc<RefCell<[HostStats; 2]>>,
}

impl CorePair {
    pub fn new(buffer_size: usize, supports_metadata: bool) -> Self {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let stats = Rc::new(RefCell::new([HostStats::default(); 2]));
        let mk = |core: usize| -> SimLink {
            Link::new(
                CoreId((1 - core) as u8),
                SimChannels {
                    core,
                    bus: bus.clone(),
                    // Disjoint port ranges per core.
                    next_port: 1 + core as u16 * 64,
                },
                SimHost {
                    core,
                    buffer_size,
                    supports_metadata,
                    stats: stats.clone(),
                },
                SimSender {
                    core,
                    bus: bus.clone(),
                },
            )
        };
        CorePair {
            p0: mk(0),
            p1: mk(1),
            bus,
            stats,
        }
    }

    /// Deliver queued events and payloads until both cores are quiet.
    pub fn pump(&mut self) -> ProtoResult<()> {
        loop {
            let work = {
                let mut bus = self.bus.borrow_mut();
                if let Some((status, channel)) = bus.events[0].pop_front() {
                    Some(Work::Event(0, status, channel))
                } else if let Some((status, channel)) = bus.events[1].pop_front() {
                    Some(Work::Event(1, status, channel))
                } else if let Some(payload) = bus.inboxes[0].pop_front() {
                    Some(Work::Payload(0, payload))
                } else if let Some(payload) = bus.inboxes[1].pop_front() {
                    Some(Work::Payload(1, payload))
                } else {
                    None
                }
            };
            match work {
                Some(Work::Event(core, status, channel)) => {
                    self.link_mut(core).on_channel_activated(status, channel);
                }
                Some(Work::Payload(core, payload)) => {
                    self.link_mut(core).on_payload(&payload)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn link_mut(&mut self, core: usize) -> &mut SimLink {
        if core == 0 {
            &mut self.p0
        } else {
            &mut self.p1
        }
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.bus.borrow().trace.clone()
    }

    pub fn stats(&self, core: usize) -> HostStats {
        self.stats.borrow()[core]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_msg::Role;

    fn run_connect(pair: &mut CorePair, source: EndpointId, sink: EndpointId, sync: bool) -> (Status, TransformId) {
        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        pair.p0
            .connect(
                source,
                sink,
                Role::RemoteSink,
                DataFormat::Pcm32,
                sync,
                Box::new(move |status, id| *out.borrow_mut() = Some((status, id))),
            )
            .unwrap();
        pair.pump().unwrap();
        let outcome = *result.borrow();
        outcome.expect("connect should complete")
    }

    #[test]
    fn end_to_end_connect_and_disconnect() {
        let mut pair = CorePair::new(1024, false);
        let (status, id) = run_connect(
            &mut pair,
            EndpointId(0x4040),
            EndpointId(0x8040).shadow(),
            false,
        );
        assert!(status.is_ok());
        assert_eq!(pair.stats(0).connects, 1);
        assert_eq!(pair.stats(1).connects, 1);
        assert!(pair.p0.transforms().find_by_id(id).unwrap().enabled);
        assert!(pair.p1.transforms().find_by_id(id).unwrap().enabled);

        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        pair.p0
            .disconnect(
                &[id],
                Box::new(move |status, count| *out.borrow_mut() = Some((status, count))),
            )
            .unwrap();
        pair.pump().unwrap();
        assert_eq!(*result.borrow(), Some((Status::Ok, 1)));
        assert!(pair.p0.transforms().is_empty());
        assert!(pair.p1.transforms().is_empty());
        assert!(pair.p0.is_idle());
        assert!(pair.p1.is_idle());
    }

    #[test]
    fn synchronized_edges_share_a_port_and_companion() {
        let mut pair = CorePair::new(512, true);
        let (status, first) = run_connect(
            &mut pair,
            EndpointId(0x4040),
            EndpointId(0x8040).shadow(),
            true,
        );
        assert!(status.is_ok());
        let (status, second) = run_connect(
            &mut pair,
            EndpointId(0x4041),
            EndpointId(0x8041).shadow(),
            true,
        );
        assert!(status.is_ok());

        let t0 = *pair.p0.transforms().find_by_id(first).unwrap();
        let t1 = *pair.p0.transforms().find_by_id(second).unwrap();
        assert_eq!(t0.data_channel.port(), t1.data_channel.port());
        assert_eq!(t0.meta_channel, t1.meta_channel);
        assert!(!t0.meta_channel.is_none());
        // The second edge attached the existing companion via the peer.
        assert!(pair
            .trace()
            .iter()
            .any(|e| e.kind == "metadata_channel_activated_req"));
    }

    #[test]
    fn fifo_payloads_are_valid_json() {
        let mut pair = CorePair::new(1024, false);
        run_connect(
            &mut pair,
            EndpointId(0x4040),
            EndpointId(0x8040).shadow(),
            false,
        );
        let kinds: Vec<&str> = pair.trace().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "create_endpoints_req",
                "create_endpoints_res",
                "connect_req",
                "connect_res",
                "connect_confirm_req",
            ]
        );
    }
}
