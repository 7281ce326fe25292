//! Neighbor resolution subsystem.
//!
//! Maps network-layer addresses to link-layer addresses. Each tracked
//! address is an explicit two-state machine: `Incomplete` (a resolution
//! request is in flight, frames wait in a bounded FIFO) or `Reachable`
//! (binding known; by construction its pending queue is empty, because the
//! transition flushes it).
//!
//! The cache is shared between the send path (`resolve`) and the dispatch
//! path (`handle_reply`/`handle_request`); every mutation passes through
//! the one mutex in here. `resolve` followed later by `handle_reply` is two
//! independent critical sections — the per-entry pending queue is what
//! bridges the gap between them. Frames are never transmitted while the
//! lock is held: a full egress queue must not stall the cache.

pub mod arp;

pub use arp::{ArpIngress, ArpResolver};

use crate::device::DeviceHandle;
use crate::error::{ConfigError, LinkError};
use crate::frame::Frame;
use crate::stats::LinkStats;
use smoltcp::wire::EthernetAddress;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Network-address family a resolver answers for. Only IPv4 ships today;
/// the registry is keyed so another family can be added without touching
/// the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
        }
    }
}

/// A pluggable resolution protocol: owns the request/reply wire exchange
/// for one address family. The concrete packet format is entirely the
/// implementation's business.
pub trait NeighborResolver: Send + Sync {
    fn family(&self) -> AddressFamily;

    /// Put a resolution request for `target` on the wire through `dev`.
    fn send_request(&self, dev: &DeviceHandle, target: Ipv4Addr);

    /// Answer a request: `target` is the locally owned address that was
    /// queried, the requester fields say where the answer goes.
    fn send_reply(
        &self,
        dev: &DeviceHandle,
        target: Ipv4Addr,
        requester_ip: Ipv4Addr,
        requester_mac: EthernetAddress,
    );
}

/// Tuning knobs for the cache.
#[derive(Debug, Clone, Copy)]
pub struct NeighborConfig {
    /// Per-entry pending queue bound; overflow drops the oldest frame.
    pub pending_depth: usize,
    /// Re-issued requests after the initial one before giving up.
    pub max_retries: u8,
    /// How long to wait for a reply before re-issuing.
    pub retry_timeout: Duration,
    /// Age after which a confirmed binding is reported stale.
    pub confirm_age: Duration,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        NeighborConfig {
            pending_depth: 16,
            max_retries: 3,
            retry_timeout: Duration::from_secs(1),
            confirm_age: Duration::from_secs(30),
        }
    }
}

/// Outcome of a `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Cache hit: the frame was encapsulated and handed to the device.
    Sent,
    /// Miss or in-flight resolution: the frame waits in the pending queue.
    Queued,
    /// No resolver registered for the address family; the frame was
    /// dropped and counted.
    Dropped,
}

/// Externally visible entry state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborStatus {
    Incomplete { pending: usize, retries: u8 },
    Reachable { link_addr: EthernetAddress, stale: bool },
}

/// A frame parked until its next hop resolves, remembering the device it
/// will leave through.
struct PendingFrame {
    dev: DeviceHandle,
    frame: Frame,
}

enum NeighborState {
    Incomplete { retries: u8, last_request: Instant },
    Reachable { link_addr: EthernetAddress, confirmed_at: Instant },
}

struct NeighborEntry {
    state: NeighborState,
    pending: VecDeque<PendingFrame>,
}

impl NeighborEntry {
    fn incomplete(now: Instant) -> Self {
        NeighborEntry {
            state: NeighborState::Incomplete {
                retries: 0,
                last_request: now,
            },
            pending: VecDeque::new(),
        }
    }

    fn push_pending(&mut self, item: PendingFrame, depth: usize, stats: &LinkStats) {
        if self.pending.len() >= depth {
            self.pending.pop_front();
            stats.dropped_pending_overflow.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.push_back(item);
    }
}

/// The shared neighbor cache plus its registered resolvers.
pub struct NeighborCache {
    entries: Mutex<HashMap<Ipv4Addr, NeighborEntry>>,
    resolvers: HashMap<AddressFamily, Box<dyn NeighborResolver>>,
    config: NeighborConfig,
    stats: Arc<LinkStats>,
}

impl NeighborCache {
    pub fn new(config: NeighborConfig, stats: Arc<LinkStats>) -> Self {
        NeighborCache {
            entries: Mutex::new(HashMap::new()),
            resolvers: HashMap::new(),
            config,
            stats,
        }
    }

    /// Register a resolution protocol. Called once during startup, before
    /// traffic flows; one resolver per family.
    pub fn add_resolver(&mut self, resolver: Box<dyn NeighborResolver>) -> Result<(), ConfigError> {
        let family = resolver.family();
        if self.resolvers.contains_key(&family) {
            return Err(ConfigError::DuplicateResolver(family));
        }
        self.resolvers.insert(family, resolver);
        Ok(())
    }

    pub fn has_resolver(&self, family: AddressFamily) -> bool {
        self.resolvers.contains_key(&family)
    }

    fn resolver(&self, family: AddressFamily) -> Option<&dyn NeighborResolver> {
        self.resolvers.get(&family).map(|r| r.as_ref())
    }

    /// Resolve `target` for a frame leaving through `dev`.
    ///
    /// A `Reachable` hit fills in the destination link address and
    /// transmits immediately. Otherwise the frame joins the entry's pending
    /// queue; the entry is created (and exactly one request issued) on the
    /// first miss, and a later `resolve` before the reply only appends —
    /// it never issues a duplicate request. Non-blocking either way: the
    /// caller does not wait for the reply.
    pub fn resolve(&self, dev: &DeviceHandle, target: Ipv4Addr, mut frame: Frame) -> Resolution {
        let hit = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&target) {
                Some(entry) => match entry.state {
                    NeighborState::Reachable {
                        link_addr,
                        confirmed_at,
                    } => {
                        let stale = confirmed_at.elapsed() > self.config.confirm_age;
                        if stale {
                            debug!(%target, "using stale neighbor binding");
                        }
                        link_addr
                    }
                    NeighborState::Incomplete { .. } => {
                        entry.push_pending(
                            PendingFrame {
                                dev: dev.clone(),
                                frame,
                            },
                            self.config.pending_depth,
                            &self.stats,
                        );
                        return Resolution::Queued;
                    }
                },
                None => {
                    if !self.has_resolver(AddressFamily::Ipv4) {
                        self.stats.dropped_no_resolver.fetch_add(1, Ordering::Relaxed);
                        warn!(%target, "no resolver for address family, dropping frame");
                        return Resolution::Dropped;
                    }
                    let mut entry = NeighborEntry::incomplete(Instant::now());
                    entry.push_pending(
                        PendingFrame {
                            dev: dev.clone(),
                            frame,
                        },
                        self.config.pending_depth,
                        &self.stats,
                    );
                    entries.insert(target, entry);
                    drop(entries);
                    debug!(%target, dev = %dev.name(), "issuing resolution request");
                    if let Some(resolver) = self.resolver(AddressFamily::Ipv4) {
                        resolver.send_request(dev, target);
                    }
                    return Resolution::Queued;
                }
            }
        };

        frame.dst = hit;
        if dev.transmit(frame).is_err() {
            debug!(dev = %dev.name(), "egress queue closed, frame dropped");
        }
        Resolution::Sent
    }

    /// Record a resolution reply: the entry becomes `Reachable` and every
    /// pending frame is sent with the learned link address, earliest
    /// first. A reply for an address we never asked about is ignored.
    pub fn handle_reply(&self, addr: Ipv4Addr, link_addr: EthernetAddress) {
        let flushed = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&addr) else {
                debug!(%addr, "unsolicited resolution reply, ignoring");
                return;
            };
            entry.state = NeighborState::Reachable {
                link_addr,
                confirmed_at: Instant::now(),
            };
            std::mem::take(&mut entry.pending)
        };

        if !flushed.is_empty() {
            debug!(%addr, %link_addr, flushed = flushed.len(), "neighbor resolved, flushing pending frames");
        }
        for PendingFrame { dev, mut frame } in flushed {
            frame.dst = link_addr;
            if dev.transmit(frame).is_err() {
                debug!(dev = %dev.name(), "egress queue closed during flush, frame dropped");
            }
        }
    }

    /// Handle a resolution request seen on `dev`. Replies only when the
    /// queried address is one of the ingress device's own interface
    /// addresses. The request also confirms the sender's binding, but only
    /// refreshes an entry we already track — unsolicited traffic cannot
    /// grow the cache.
    pub fn handle_request(
        &self,
        target: Ipv4Addr,
        requester_ip: Ipv4Addr,
        requester_mac: EthernetAddress,
        dev: &DeviceHandle,
    ) {
        self.handle_reply(requester_ip, requester_mac);

        if !dev.owns_addr(target) {
            return;
        }
        debug!(%target, %requester_ip, dev = %dev.name(), "answering resolution request");
        match self.resolver(AddressFamily::Ipv4) {
            Some(resolver) => resolver.send_reply(dev, target, requester_ip, requester_mac),
            None => warn!(%target, "request for owned address but no resolver registered"),
        }
    }

    /// Drive the retry clock.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Retry pass at an explicit instant (tests drive this directly). An
    /// `Incomplete` entry whose request has gone `retry_timeout` without a
    /// reply is re-requested, up to `max_retries` times; past that the
    /// entry is evicted and its pending frames discarded — delivery here
    /// is best-effort, originators get no confirmation.
    pub fn sweep_at(&self, now: Instant) {
        let mut requests: Vec<(DeviceHandle, Ipv4Addr)> = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|addr, entry| {
                let NeighborState::Incomplete {
                    retries,
                    last_request,
                } = &mut entry.state
                else {
                    return true;
                };
                if now.duration_since(*last_request) < self.config.retry_timeout {
                    return true;
                }
                if *retries >= self.config.max_retries {
                    debug!(
                        error = %LinkError::ResolutionTimeout(*addr),
                        discarded = entry.pending.len(),
                        "evicting neighbor entry"
                    );
                    self.stats
                        .dropped_resolution
                        .fetch_add(entry.pending.len() as u64, Ordering::Relaxed);
                    return false;
                }
                *retries += 1;
                *last_request = now;
                debug!(%addr, retry = *retries, "re-issuing resolution request");
                if let Some(p) = entry.pending.front() {
                    requests.push((p.dev.clone(), *addr));
                }
                true
            });
        }

        for (dev, addr) in requests {
            if let Some(resolver) = self.resolver(AddressFamily::Ipv4) {
                resolver.send_request(&dev, addr);
            }
        }
    }

    /// Drop every entry, discarding any pending frames.
    pub fn flush(&self) {
        let mut entries = self.entries.lock().unwrap();
        let discarded: usize = entries.values().map(|e| e.pending.len()).sum();
        if discarded > 0 {
            self.stats
                .dropped_resolution
                .fetch_add(discarded as u64, Ordering::Relaxed);
        }
        entries.clear();
    }

    /// Current state of one entry, if tracked.
    pub fn status(&self, addr: Ipv4Addr) -> Option<NeighborStatus> {
        let entries = self.entries.lock().unwrap();
        entries.get(&addr).map(|entry| match entry.state {
            NeighborState::Incomplete { retries, .. } => NeighborStatus::Incomplete {
                pending: entry.pending.len(),
                retries,
            },
            NeighborState::Reachable {
                link_addr,
                confirmed_at,
            } => NeighborStatus::Reachable {
                link_addr,
                stale: confirmed_at.elapsed() > self.config.confirm_age,
            },
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
