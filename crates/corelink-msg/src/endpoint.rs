//! External endpoint id encoding.
//!
//! Endpoint ids are the handles applications use to name stream sources
//! and sinks. The direction lives in the top two bits, a shadow marker
//! (the id names a local proxy for an endpoint on the other core) in
//! bit 13 and a hardware marker in bit 12. The low bits identify the
//! owning entity; the lowest six are the terminal number on it.

use serde::{Deserialize, Serialize};
use std::fmt;

const SINK_BIT: u16 = 0x8000;
const SOURCE_BIT: u16 = 0x4000;
const SHADOW_BIT: u16 = 0x2000;
const REAL_BIT: u16 = 0x1000;
const TERMINAL_MASK: u16 = 0x003F;

/// External stream endpoint identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u16);

impl EndpointId {
    pub const NONE: EndpointId = EndpointId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_source(self) -> bool {
        self.0 & SOURCE_BIT != 0 && self.0 & SINK_BIT == 0
    }

    pub fn is_sink(self) -> bool {
        self.0 & SINK_BIT != 0 && self.0 & SOURCE_BIT == 0
    }

    /// Exactly one direction bit must be set for a well-formed id.
    pub fn is_well_formed(self) -> bool {
        self.is_source() != self.is_sink() && !self.is_none()
    }

    /// True if the id names a local proxy for an endpoint on the peer core.
    pub fn is_shadow(self) -> bool {
        self.0 & SHADOW_BIT != 0
    }

    /// True if the id names a hardware (real) endpoint rather than an
    /// operator terminal.
    pub fn is_real(self) -> bool {
        self.0 & REAL_BIT != 0
    }

    /// The id with the shadow marker stripped: how the peer core that
    /// actually hosts the endpoint names it.
    pub fn base(self) -> Self {
        EndpointId(self.0 & !SHADOW_BIT)
    }

    /// The id with the shadow marker set: how a core names its local
    /// proxy for this endpoint.
    pub fn shadow(self) -> Self {
        EndpointId(self.0 | SHADOW_BIT)
    }

    /// Terminal number on the owning operator or hardware instance.
    pub fn terminal(self) -> u16 {
        self.0 & TERMINAL_MASK
    }

    /// Ids that name the same underlying terminal group, ignoring the
    /// shadow marker. Used for port sharing across synchronized channels.
    pub fn same_base(self, other: EndpointId) -> bool {
        self.base() == other.base()
    }

    /// The owning entity, ignoring shadow marker and terminal number.
    /// Two terminals of one operator share a group.
    pub fn group(self) -> Self {
        EndpointId(self.0 & !(SHADOW_BIT | TERMINAL_MASK))
    }

    /// True if both ids belong to the same owning entity.
    pub fn same_group(self, other: EndpointId) -> bool {
        self.group() == other.group()
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({:#06x})", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
