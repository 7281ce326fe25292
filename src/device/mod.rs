//! Network device capability and per-device workers.
//!
//! A device is anything that can move raw Ethernet frames: a TAP interface,
//! the loopback device, or an in-memory test wire. Concrete devices own all
//! OS-specific configuration; the layer only sees the [`Device`] capability
//! set and talks to it through its queue pair.
//!
//! Each registered device gets two workers: an rx worker that turns raw
//! reads into parsed frames on the layer's inbound queue, and a tx worker
//! that drains the device's egress queue onto the medium. Workers block
//! only on device I/O and queue operations.

pub mod loopback;
pub mod tap;

pub use loopback::Loopback;
pub use tap::TapDevice;

use crate::error::ConfigError;
use crate::frame::{Frame, MAX_FRAME_LEN};
use crate::queue::{QueueRx, QueueTx};
use crate::stats::LinkStats;
use crossbeam_channel::Receiver;
use ipnet::Ipv4Net;
use smoltcp::wire::EthernetAddress;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// An interface address bound to a device: network-layer address with its
/// prefix, plus an optional gateway for traffic leaving the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    net: Ipv4Net,
    gateway: Option<Ipv4Addr>,
}

impl InterfaceAddr {
    pub fn new(net: Ipv4Net, gateway: Option<Ipv4Addr>) -> Self {
        InterfaceAddr { net, gateway }
    }

    /// Parse an `addr/prefix` string such as `"192.168.1.1/24"`.
    pub fn parse(s: &str, gateway: Option<Ipv4Addr>) -> Result<Self, ConfigError> {
        let net = s
            .parse::<Ipv4Net>()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        Ok(InterfaceAddr { net, gateway })
    }

    /// The interface's own address.
    pub fn addr(&self) -> Ipv4Addr {
        self.net.addr()
    }

    /// The covered network, host bits cleared.
    pub fn network(&self) -> Ipv4Net {
        self.net.trunc()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// Whether `addr` falls inside this interface's network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }
}

impl fmt::Display for InterfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

/// The capability set a concrete device must provide. No shared base state:
/// each implementation independently owns its medium.
///
/// `read_frame`/`write_frame` take `&self` — devices use interior
/// mutability so the rx and tx workers can share one instance.
pub trait Device: Send + Sync {
    /// Stable identifier, unique per layer instance.
    fn name(&self) -> &str;

    /// The device's own link address.
    fn link_addr(&self) -> EthernetAddress;

    /// Interface addresses in priority order (insertion order).
    fn addrs(&self) -> &[InterfaceAddr];

    /// Read one raw frame into `buf`, blocking until one is available.
    /// Returns the frame length.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one raw frame to the medium.
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;

    /// Shutdown hook: wake any reader blocked in `read_frame` so its worker
    /// can observe closure and exit. Default is a no-op for media whose
    /// reads finish on their own.
    fn close(&self) {}
}

/// Cheap-clone runtime handle to a registered device: identity, addresses,
/// and the producer end of its egress queue. Held by routing table entries
/// and frames pending neighbor resolution.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    link_addr: EthernetAddress,
    addrs: Vec<InterfaceAddr>,
    egress: QueueTx<Frame>,
}

impl DeviceHandle {
    pub(crate) fn new(
        name: String,
        link_addr: EthernetAddress,
        addrs: Vec<InterfaceAddr>,
        egress: QueueTx<Frame>,
    ) -> Self {
        DeviceHandle {
            inner: Arc::new(HandleInner {
                name,
                link_addr,
                addrs,
                egress,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn link_addr(&self) -> EthernetAddress {
        self.inner.link_addr
    }

    pub fn addrs(&self) -> &[InterfaceAddr] {
        &self.inner.addrs
    }

    /// Whether `addr` is one of this device's own interface addresses.
    pub fn owns_addr(&self, addr: Ipv4Addr) -> bool {
        self.inner.addrs.iter().any(|ia| ia.addr() == addr)
    }

    /// Source address selection for a destination: the first interface
    /// address whose network covers it, falling back to the
    /// highest-priority address.
    pub fn source_addr_for(&self, dst: Ipv4Addr) -> Option<InterfaceAddr> {
        self.inner
            .addrs
            .iter()
            .find(|ia| ia.contains(dst))
            .or_else(|| self.inner.addrs.first())
            .copied()
    }

    /// Hand a frame to the device's tx worker. Blocks while the egress
    /// queue is full (backpressure).
    pub fn transmit(&self, frame: Frame) -> Result<(), crate::queue::Closed> {
        self.inner.egress.push(frame)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.inner.name)
            .field("link_addr", &self.inner.link_addr)
            .field("addrs", &self.inner.addrs)
            .finish()
    }
}

/// A frame fresh off a device, tagged with where it came from.
pub(crate) struct Ingress {
    pub frame: Frame,
    pub dev: DeviceHandle,
}

/// Spawn the reader worker: raw frames off the medium, parsed, onto the
/// layer's inbound queue. Exits when the device or the layer closes.
pub(crate) fn spawn_rx_worker(
    dev: Arc<dyn Device>,
    handle: DeviceHandle,
    ingress: QueueTx<Ingress>,
    stats: Arc<LinkStats>,
) -> Result<JoinHandle<()>, ConfigError> {
    let name = format!("link-rx-{}", dev.name());
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            loop {
                let n = match dev.read_frame(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(dev = %handle.name(), "device closed, rx worker exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(dev = %handle.name(), error = %e, "device read failed");
                        break;
                    }
                };
                let Some(frame) = Frame::parse(&buf[..n]) else {
                    stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(dev = %handle.name(), len = n, "dropping malformed frame");
                    continue;
                };
                let item = Ingress {
                    frame,
                    dev: handle.clone(),
                };
                if ingress.push(item).is_err() {
                    // Layer shut down; observe closure and stop producing.
                    break;
                }
            }
        })
        .map_err(|e| ConfigError::Spawn { name, source: e })
}

/// Spawn the writer worker: frames off the egress queue, serialized, onto
/// the medium. Exits on queue closure or the shutdown signal, without
/// processing further items.
pub(crate) fn spawn_tx_worker(
    dev: Arc<dyn Device>,
    egress: QueueRx<Frame>,
    shutdown: Receiver<()>,
    stats: Arc<LinkStats>,
) -> Result<JoinHandle<()>, ConfigError> {
    let name = format!("link-tx-{}", dev.name());
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(egress.raw()) -> msg => {
                        let Ok(frame) = msg else { break };
                        let raw = frame.emit();
                        match dev.write_frame(&raw) {
                            Ok(_) => {
                                stats.tx_frames.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                debug!(dev = %dev.name(), error = %e, "device write failed, frame dropped");
                            }
                        }
                    }
                    recv(shutdown) -> _ => break,
                }
            }
        })
        .map_err(|e| ConfigError::Spawn { name, source: e })
}
