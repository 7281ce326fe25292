//! Routing table with longest-prefix-match lookup.
//!
//! Answers "which device and next hop reaches destination X". Routes are
//! installed by startup/orchestration code (connected routes derived from
//! device addresses, a default route, static routes) and read by the send
//! path; the table is shared behind one reader-writer lock.

use crate::device::DeviceHandle;
use crate::error::{ConfigError, LinkError};
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Where to forward after the egress device is chosen: straight to the
/// destination itself, or through a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Destination is on-link; resolve its own address, no indirection.
    Direct,
    /// Forward through this gateway.
    Via(Ipv4Addr),
}

impl NextHop {
    /// The network address the link layer actually has to resolve for a
    /// given destination.
    pub fn resolve_target(&self, dst: Ipv4Addr) -> Ipv4Addr {
        match self {
            NextHop::Direct => dst,
            NextHop::Via(gw) => *gw,
        }
    }
}

/// One routing decision: prefix, egress device, next hop.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: Ipv4Net,
    pub device: DeviceHandle,
    pub next_hop: NextHop,
}

struct Slot {
    device: DeviceHandle,
    next_hop: NextHop,
}

/// Prefix → (device, next hop) table. No duplicate prefixes: inserting an
/// existing prefix replaces it. Cloning shares the underlying table.
#[derive(Clone)]
pub struct RoutingTable {
    inner: Arc<RwLock<PrefixMap<Ipv4Net, Slot>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            inner: Arc::new(RwLock::new(PrefixMap::new())),
        }
    }

    /// Longest-prefix-match lookup. When both a shorter and a longer prefix
    /// cover the destination, the longer (more specific) one wins.
    pub fn lookup(&self, dst: Ipv4Addr) -> Result<Route, LinkError> {
        let key = Ipv4Net::new(dst, 32).unwrap();
        let inner = self.inner.read().unwrap();
        inner
            .get_lpm(&key)
            .map(|(prefix, slot)| Route {
                prefix: *prefix,
                device: slot.device.clone(),
                next_hop: slot.next_hop,
            })
            .ok_or(LinkError::NoRouteFound(dst))
    }

    /// Derive one directly-connected route per interface address on the
    /// device.
    pub fn add_connected_routes(&self, device: &DeviceHandle) {
        let mut inner = self.inner.write().unwrap();
        for ia in device.addrs() {
            let prefix = ia.network();
            debug!(dev = %device.name(), %prefix, "adding connected route");
            inner.insert(
                prefix,
                Slot {
                    device: device.clone(),
                    next_hop: NextHop::Direct,
                },
            );
        }
    }

    /// Install the catch-all route used when nothing more specific matches.
    pub fn set_default_route(&self, gateway: Ipv4Addr, device: &DeviceHandle) {
        let prefix = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap();
        debug!(dev = %device.name(), %gateway, "setting default route");
        self.inner.write().unwrap().insert(
            prefix,
            Slot {
                device: device.clone(),
                next_hop: NextHop::Via(gateway),
            },
        );
    }

    /// Install a static route. The prefix must be a proper network address
    /// (no host bits).
    pub fn add_route(
        &self,
        prefix: Ipv4Net,
        device: &DeviceHandle,
        next_hop: NextHop,
    ) -> Result<(), ConfigError> {
        if prefix.addr() != prefix.network() {
            return Err(ConfigError::InvalidPrefix(prefix.to_string()));
        }
        debug!(dev = %device.name(), %prefix, ?next_hop, "adding route");
        self.inner.write().unwrap().insert(
            prefix,
            Slot {
                device: device.clone(),
                next_hop,
            },
        );
        Ok(())
    }

    /// Remove a route by exact prefix. Returns the removed route, if any.
    pub fn remove_route(&self, prefix: &Ipv4Net) -> Option<Route> {
        self.inner.write().unwrap().remove(prefix).map(|slot| Route {
            prefix: *prefix,
            device: slot.device,
            next_hop: slot.next_hop,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
