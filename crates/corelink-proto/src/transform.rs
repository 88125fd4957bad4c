//! Cross-core transform bookkeeping.
//!
//! Every transform whose endpoints straddle the two cores of a link has
//! an entry here on both sides, keyed by the link-unique transform id.
//! Purely local transforms are the endpoint host's business and never
//! appear in this table.

use corelink_msg::{ChannelId, EndpointId, TransformId};

use crate::error::{ProtoError, Result};
use crate::ipc::CoreId;

/// Maximum cross-core transforms tracked per link, one per data channel.
pub const MAX_TRANSFORMS: usize = corelink_msg::MAX_DATA_CHANNELS as usize;

/// One cross-core transform entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    pub id: TransformId,
    /// Source endpoint as named on this core (shadow bit set if remote).
    pub source: EndpointId,
    /// Sink endpoint as named on this core (shadow bit set if remote).
    pub sink: EndpointId,
    pub data_channel: ChannelId,
    /// Metadata companion channel, `ChannelId::NONE` when absent.
    pub meta_channel: ChannelId,
    /// The core hosting the other half of the edge.
    pub remote_core: CoreId,
    /// False while the connect sequence is still in flight or once a
    /// disconnect has begun; data must not move on a disabled transform.
    pub enabled: bool,
}

impl Transform {
    pub fn real_source(&self) -> bool {
        self.source.is_real() && !self.source.is_shadow()
    }

    pub fn real_sink(&self) -> bool {
        self.sink.is_real() && !self.sink.is_shadow()
    }

    fn has_shadow(&self) -> bool {
        self.source.is_shadow() || self.sink.is_shadow()
    }

    /// The endpoint on the far side of `endpoint` within this transform.
    pub fn other_end(&self, endpoint: EndpointId) -> EndpointId {
        if endpoint.is_sink() {
            self.source
        } else {
            self.sink
        }
    }
}

/// Slot table of cross-core transforms on one link.
#[derive(Debug)]
pub struct TransformRegistry {
    slots: Vec<Option<Transform>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        TransformRegistry {
            slots: vec![None; MAX_TRANSFORMS],
        }
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: Transform) -> Result<()> {
        if entry.id.is_none() {
            return Err(ProtoError::Validation("transform id 0"));
        }
        if self.find_by_id(entry.id).is_some() {
            return Err(ProtoError::Validation("transform id already in use"));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(ProtoError::ResourceExhausted("transform"))?;
        *slot = Some(entry);
        Ok(())
    }

    /// Drop an entry. Unknown ids are a no-op.
    pub fn remove(&mut self, id: TransformId) -> Option<Transform> {
        self.slots
            .iter_mut()
            .find(|s| s.map(|t| t.id) == Some(id))?
            .take()
    }

    pub fn find_by_id(&self, id: TransformId) -> Option<&Transform> {
        self.slots.iter().flatten().find(|t| t.id == id)
    }

    pub fn find_by_id_mut(&mut self, id: TransformId) -> Option<&mut Transform> {
        self.slots.iter_mut().flatten().find(|t| t.id == id)
    }

    /// Entry using `channel` as its data or metadata channel, direction
    /// ignored.
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<&Transform> {
        self.slots.iter().flatten().find(|t| {
            t.data_channel == channel
                || t.data_channel.inverted() == channel
                || (!t.meta_channel.is_none()
                    && (t.meta_channel == channel || t.meta_channel.inverted() == channel))
        })
    }

    /// Entry touching `endpoint` as source or sink.
    pub fn find_by_endpoint(&self, endpoint: EndpointId) -> Option<&Transform> {
        self.slots
            .iter()
            .flatten()
            .find(|t| t.source == endpoint || t.sink == endpoint)
    }

    /// A connected cross-core entry between the same entity pair, used
    /// to reuse the data-channel port for synchronized multi-channel
    /// connections. The match ignores terminal numbers on whichever
    /// side is an operator; a real endpoint matches any real endpoint
    /// on the same side.
    pub fn find_port_peer(&self, source: EndpointId, sink: EndpointId) -> Option<&Transform> {
        let source_is_anchor = if sink.is_real() { true } else { !source.is_real() };
        self.slots.iter().flatten().find(|t| {
            if !t.has_shadow() {
                return false;
            }
            let source_match = t.source.same_group(source);
            let sink_match = t.sink.same_group(sink);
            if source_is_anchor {
                source_match && ((sink.is_real() && t.real_sink()) || sink_match)
            } else {
                sink_match && ((source.is_real() && t.real_source()) || source_match)
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transform> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_msg::ChannelDirection;

    fn entry(id: u16, source: u16, sink: u16, channel: ChannelId) -> Transform {
        Transform {
            id: TransformId(id),
            source: EndpointId(source),
            sink: EndpointId(sink),
            data_channel: channel,
            meta_channel: ChannelId::NONE,
            remote_core: CoreId(1),
            enabled: true,
        }
    }

    #[test]
    fn add_find_remove() {
        let mut reg = TransformRegistry::new();
        let ch = ChannelId::new(2, 0, ChannelDirection::Write);
        reg.add(entry(7, 0x4001, 0xA002, ch)).unwrap();
        assert_eq!(reg.find_by_id(TransformId(7)).unwrap().sink, EndpointId(0xA002));
        assert!(reg.find_by_channel(ch.inverted()).is_some());
        assert!(reg.find_by_endpoint(EndpointId(0x4001)).is_some());
        assert!(reg.remove(TransformId(7)).is_some());
        assert!(reg.remove(TransformId(7)).is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut reg = TransformRegistry::new();
        let ch = ChannelId::new(1, 0, ChannelDirection::Write);
        reg.add(entry(3, 0x4001, 0xA002, ch)).unwrap();
        assert!(reg.add(entry(3, 0x4002, 0xA003, ch)).is_err());
    }

    #[test]
    fn port_peer_matches_sibling_terminal() {
        let mut reg = TransformRegistry::new();
        let ch = ChannelId::new(4, 0, ChannelDirection::Write);
        // Operator source terminal 0 connected to a shadow sink.
        reg.add(entry(5, 0x4040, 0xA041, ch)).unwrap();
        // Terminal 1 of the same operator pair shares the port.
        let peer = reg
            .find_port_peer(EndpointId(0x4041), EndpointId(0xA042))
            .unwrap();
        assert_eq!(peer.data_channel.port(), 4);
        // A different operator does not.
        assert!(reg
            .find_port_peer(EndpointId(0x4080), EndpointId(0xA081))
            .is_none());
    }

    #[test]
    fn metadata_channel_is_searchable() {
        let mut reg = TransformRegistry::new();
        let data = ChannelId::new(3, 0, ChannelDirection::Write);
        let mut t = entry(9, 0x4001, 0xA002, data);
        t.meta_channel = data.metadata_companion();
        reg.add(t).unwrap();
        assert!(reg.find_by_channel(data.metadata_companion()).is_some());
        assert!(reg
            .find_by_channel(data.metadata_companion().inverted())
            .is_some());
    }
}
