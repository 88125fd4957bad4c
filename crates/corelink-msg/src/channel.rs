//! Data-channel id encoding.
//!
//! A channel id packs three facts into one `u16`: the channel number on
//! its port (bits 0-3), the port group (bits 4-14) and the transfer
//! direction seen from the encoding core (bit 15). Channel id 0 means
//! "no channel".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of data channels available on one port group.
pub const MAX_DATA_CHANNELS: u16 = 16;

/// Channel number reserved for the metadata companion channel.
///
/// Always the highest number on the port, so a channel whose number
/// equals this is a metadata channel by construction.
pub const META_CHANNEL_NUM: u16 = MAX_DATA_CHANNELS - 1;

const NUMBER_MASK: u16 = 0x000F;
const PORT_SHIFT: u16 = 4;
const PORT_MASK: u16 = 0x07FF;
const DIRECTION_BIT: u16 = 0x8000;

/// Transfer direction of a data channel, from the owning core's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDirection {
    /// The local core writes into the shared buffer.
    Write,
    /// The local core reads from the shared buffer.
    Read,
}

impl ChannelDirection {
    pub fn inverted(self) -> Self {
        match self {
            ChannelDirection::Write => ChannelDirection::Read,
            ChannelDirection::Read => ChannelDirection::Write,
        }
    }
}

/// Packed data-channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// The "no channel" sentinel.
    pub const NONE: ChannelId = ChannelId(0);

    pub fn new(port: u16, number: u16, direction: ChannelDirection) -> Self {
        let dir = match direction {
            ChannelDirection::Write => 0,
            ChannelDirection::Read => DIRECTION_BIT,
        };
        ChannelId((number & NUMBER_MASK) | ((port & PORT_MASK) << PORT_SHIFT) | dir)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Channel number within the port group.
    pub fn number(self) -> u16 {
        self.0 & NUMBER_MASK
    }

    /// Port group, 0 if the channel has not been bound to a port yet.
    pub fn port(self) -> u16 {
        (self.0 >> PORT_SHIFT) & PORT_MASK
    }

    pub fn direction(self) -> ChannelDirection {
        if self.0 & DIRECTION_BIT == 0 {
            ChannelDirection::Write
        } else {
            ChannelDirection::Read
        }
    }

    /// The same channel as seen from the peer core.
    pub fn inverted(self) -> Self {
        ChannelId(self.0 ^ DIRECTION_BIT)
    }

    /// True if this id names the metadata companion channel of its port.
    pub fn is_metadata(self) -> bool {
        self.number() == META_CHANNEL_NUM
    }

    /// The metadata companion channel on the same port and direction.
    pub fn metadata_companion(self) -> Self {
        ChannelId(self.0 | META_CHANNEL_NUM)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:#06x})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
