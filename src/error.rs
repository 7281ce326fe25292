//! Error taxonomy.
//!
//! Two families with different propagation rules: [`ConfigError`] values are
//! startup-time failures that abort initialization, while [`LinkError`]
//! values are per-frame runtime failures that are absorbed (dropped and
//! counted) at the point of detection and never unwind a dispatch loop.

use smoltcp::wire::EthernetProtocol;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Startup-time configuration failures. Fatal to initialization: they
/// indicate a broken topology, not a runtime fluctuation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("protocol handler already registered for {0}")]
    DuplicateProtocol(EthernetProtocol),

    #[error("neighbor resolver already registered for {0}")]
    DuplicateResolver(crate::neighbor::AddressFamily),

    #[error("device name '{0}' already in use")]
    DuplicateDevice(String),

    #[error("invalid interface address '{0}'")]
    InvalidAddress(String),

    #[error("invalid route prefix '{0}': host bits set")]
    InvalidPrefix(String),

    #[error("failed to spawn worker thread '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runtime, per-frame failures. Non-fatal: the affected frame is dropped
/// and a diagnostic counter incremented.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no protocol handler for {0}")]
    ProtocolNotFound(EthernetProtocol),

    #[error("no route to {0}")]
    NoRouteFound(Ipv4Addr),

    #[error("address resolution for {0} timed out")]
    ResolutionTimeout(Ipv4Addr),

    #[error("queue closed")]
    QueueClosed,
}

impl From<crate::queue::Closed> for LinkError {
    fn from(_: crate::queue::Closed) -> Self {
        LinkError::QueueClosed
    }
}
