//! Protocol registry.
//!
//! Maps a protocol identifier (EtherType) to its registered handler. The
//! table is assembled at startup and immutable afterwards, so the two
//! dispatch loops can share it without locking; handlers use interior
//! mutability for whatever state they carry.

use crate::device::DeviceHandle;
use crate::error::{ConfigError, LinkError};
use crate::frame::{Frame, SendRequest};
use smoltcp::wire::EthernetProtocol;
use std::collections::HashMap;

/// A registered protocol handler.
///
/// `receive` runs synchronously on the layer's inbound dispatch loop: a
/// handler that blocks stalls every device's inbound path, so long work
/// belongs on the handler's own queues. `send` runs on the outbound loop
/// under the same rule.
pub trait LinkProtocol: Send + Sync {
    /// The protocol identifier this handler answers for.
    fn ethertype(&self) -> EthernetProtocol;

    /// Inbound path: one frame, already demultiplexed to this handler.
    fn receive(&self, frame: Frame, ingress: &DeviceHandle);

    /// Outbound path: a payload plus destination network address from a
    /// layer above.
    fn send(&self, request: SendRequest);
}

/// EtherType → handler table. A registry never holds two handlers for the
/// same identifier: a duplicate registration is a broken topology and is
/// rejected at startup rather than silently overwritten.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<u16, Box<dyn LinkProtocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn LinkProtocol>) -> Result<(), ConfigError> {
        let ethertype = handler.ethertype();
        let key = u16::from(ethertype);
        if self.handlers.contains_key(&key) {
            return Err(ConfigError::DuplicateProtocol(ethertype));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, ethertype: EthernetProtocol) -> Result<&dyn LinkProtocol, LinkError> {
        self.handlers
            .get(&u16::from(ethertype))
            .map(|h| h.as_ref())
            .ok_or(LinkError::ProtocolNotFound(ethertype))
    }

    pub fn contains(&self, ethertype: EthernetProtocol) -> bool {
        self.handlers.contains_key(&u16::from(ethertype))
    }

    /// Registered identifiers, for diagnostics.
    pub fn ethertypes(&self) -> Vec<EthernetProtocol> {
        self.handlers
            .keys()
            .map(|&k| EthernetProtocol::from(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
