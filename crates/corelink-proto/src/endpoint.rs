//! Endpoint bookkeeping for one link.
//!
//! The registry tracks the endpoint halves this core created for
//! cross-core edges: real device endpoints, operator terminals and
//! shadow proxies for endpoints hosted by the peer. Slots are a fixed
//! vector; creation fails once the table is full.

use corelink_msg::EndpointId;

use crate::error::{ProtoError, Result};

/// Maximum endpoints tracked per link.
pub const MAX_ENDPOINTS: usize = 32;

/// What kind of object an endpoint id resolves to on this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// A hardware endpoint hosted here.
    Real,
    /// An operator terminal hosted here.
    Operator,
    /// A local proxy for an endpoint on the peer core.
    Shadow,
}

/// One tracked endpoint half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub kind: EndpointKind,
}

/// Slot table of endpoints created for cross-core edges.
#[derive(Debug)]
pub struct EndpointRegistry {
    slots: Vec<Option<Endpoint>>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        EndpointRegistry {
            slots: vec![None; MAX_ENDPOINTS],
        }
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new endpoint. The id must not already be present.
    pub fn create(&mut self, id: EndpointId, kind: EndpointKind) -> Result<()> {
        if id.is_none() {
            return Err(ProtoError::Validation("endpoint id 0"));
        }
        if self.contains(id) {
            return Err(ProtoError::Validation("endpoint already exists"));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(ProtoError::ResourceExhausted("endpoint"))?;
        *slot = Some(Endpoint { id, kind });
        Ok(())
    }

    /// Stop tracking an endpoint. Unknown ids are a no-op.
    pub fn destroy(&mut self, id: EndpointId) -> Option<Endpoint> {
        self.slots
            .iter_mut()
            .find(|s| s.map(|e| e.id) == Some(id))?
            .take()
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.id == id)
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.slots.iter().flatten()
    }
}

/// Kind of the local endpoint behind a non-shadow id.
pub fn local_kind(id: EndpointId) -> EndpointKind {
    if id.is_real() {
        EndpointKind::Real
    } else {
        EndpointKind::Operator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_destroy() {
        let mut reg = EndpointRegistry::new();
        reg.create(EndpointId(0x4001), EndpointKind::Operator).unwrap();
        assert!(reg.contains(EndpointId(0x4001)));
        assert_eq!(reg.get(EndpointId(0x4001)).unwrap().kind, EndpointKind::Operator);
        assert!(reg.destroy(EndpointId(0x4001)).is_some());
        assert!(!reg.contains(EndpointId(0x4001)));
        assert!(reg.destroy(EndpointId(0x4001)).is_none());
    }

    #[test]
    fn rejects_duplicates_and_zero() {
        let mut reg = EndpointRegistry::new();
        reg.create(EndpointId(0x8002), EndpointKind::Shadow).unwrap();
        assert!(matches!(
            reg.create(EndpointId(0x8002), EndpointKind::Shadow),
            Err(ProtoError::Validation(_))
        ));
        assert!(reg.create(EndpointId::NONE, EndpointKind::Real).is_err());
    }

    #[test]
    fn exhausts_slots() {
        let mut reg = EndpointRegistry::new();
        for i in 0..MAX_ENDPOINTS as u16 {
            reg.create(EndpointId(0x4040 + i), EndpointKind::Operator)
                .unwrap();
        }
        assert!(matches!(
            reg.create(EndpointId(0x7FFF), EndpointKind::Operator),
            Err(ProtoError::ResourceExhausted("endpoint"))
        ));
    }
}
