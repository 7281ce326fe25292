//! Link layer composition root.
//!
//! Owns the protocol registry, wires every device's reader into the
//! dispatcher's inbound queue, and exposes the layer's own queue pair to
//! the stack above: push [`SendRequest`]s down, pop [`Delivery`]s up.
//!
//! Everything is handed in before [`LinkLayerBuilder::start`] and nothing
//! is rewired afterwards; duplicate registrations surface as
//! [`ConfigError`] at build time. `start` spawns the per-device workers,
//! the two dispatch loops, and the neighbor retry timer; `shutdown`
//! closes the queues and the workers exit where they would otherwise
//! block.

use crate::device::{self, Device, DeviceHandle, Ingress};
use crate::error::{ConfigError, LinkError};
use crate::ethernet::EthernetIpv4;
use crate::frame::{Delivery, SendRequest};
use crate::neighbor::{
    AddressFamily, ArpIngress, ArpResolver, NeighborCache, NeighborConfig, NeighborResolver,
};
use crate::queue::{self, Closed, QueueRx, QueueTx};
use crate::registry::{LinkProtocol, ProtocolRegistry};
use crate::routing::RoutingTable;
use crate::stats::LinkStats;
use crossbeam_channel::{Sender, bounded, tick};
use smoltcp::wire::EthernetProtocol;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capacity of each transport queue unless overridden.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Everything a link layer is built from. Construction-time dependency
/// injection: devices, extra protocol handlers, and resolvers go in here,
/// once, before any traffic flows.
pub struct LinkLayerBuilder {
    devices: Vec<Arc<dyn Device>>,
    protocols: Vec<Box<dyn LinkProtocol>>,
    resolvers: Vec<Box<dyn NeighborResolver>>,
    neighbor_config: NeighborConfig,
    queue_depth: usize,
}

impl LinkLayerBuilder {
    fn new() -> Self {
        LinkLayerBuilder {
            devices: Vec::new(),
            protocols: Vec::new(),
            resolvers: Vec::new(),
            neighbor_config: NeighborConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Attach a device. Its name must be unique within the layer.
    pub fn device(mut self, dev: impl Device + 'static) -> Self {
        self.devices.push(Arc::new(dev));
        self
    }

    /// Register an additional protocol handler. The stock IPv4 and ARP
    /// handlers are always present; registering either ethertype again
    /// fails at `start`.
    pub fn protocol(mut self, handler: Box<dyn LinkProtocol>) -> Self {
        self.protocols.push(handler);
        self
    }

    /// Register a resolution protocol. ARP is installed for IPv4 unless a
    /// resolver for that family is supplied here.
    pub fn resolver(mut self, resolver: Box<dyn NeighborResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn neighbor_config(mut self, config: NeighborConfig) -> Self {
        self.neighbor_config = config;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Wire everything together and start the workers.
    pub fn start(self) -> Result<LinkLayer, ConfigError> {
        let depth = self.queue_depth.max(1);
        let stats = Arc::new(LinkStats::default());

        // Validate the topology before any thread exists.
        let mut seen = HashSet::new();
        for dev in &self.devices {
            if !seen.insert(dev.name().to_string()) {
                return Err(ConfigError::DuplicateDevice(dev.name().to_string()));
            }
        }

        let mut cache = NeighborCache::new(self.neighbor_config, stats.clone());
        let mut have_ipv4 = false;
        for resolver in self.resolvers {
            have_ipv4 |= resolver.family() == AddressFamily::Ipv4;
            cache.add_resolver(resolver)?;
        }
        if !have_ipv4 {
            cache.add_resolver(Box::new(ArpResolver))?;
        }
        let neighbors = Arc::new(cache);

        let routes = RoutingTable::new();

        let (delivery_tx, delivery_rx) = queue::pair::<Delivery>(depth);
        let (outbound_tx, outbound_rx) = queue::pair::<SendRequest>(depth);
        let (ingress_tx, ingress_rx) = queue::pair::<Ingress>(depth);

        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(ArpIngress::new(neighbors.clone(), stats.clone())))?;
        registry.register(Box::new(EthernetIpv4::new(
            routes.clone(),
            neighbors.clone(),
            delivery_tx,
            stats.clone(),
        )))?;
        for handler in self.protocols {
            registry.register(handler)?;
        }
        let registry = Arc::new(registry);

        // Dropping this sender is the shutdown broadcast: every worker
        // holding a receiver observes the disconnect.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let mut threads = Vec::new();
        let mut handles = HashMap::new();

        for dev in &self.devices {
            let (egress_tx, egress_rx) = queue::pair(depth);
            let handle = DeviceHandle::new(
                dev.name().to_string(),
                dev.link_addr(),
                dev.addrs().to_vec(),
                egress_tx,
            );
            threads.push(device::spawn_rx_worker(
                dev.clone(),
                handle.clone(),
                ingress_tx.clone(),
                stats.clone(),
            )?);
            threads.push(device::spawn_tx_worker(
                dev.clone(),
                egress_rx,
                shutdown_rx.clone(),
                stats.clone(),
            )?);
            info!(dev = %dev.name(), link_addr = %dev.link_addr(), "device attached");
            handles.insert(dev.name().to_string(), handle);
        }
        // The device workers now hold the only inbound producers.
        drop(ingress_tx);

        // Inbound dispatch: demultiplex by the frame's protocol id.
        {
            let registry = registry.clone();
            let stats = stats.clone();
            let shutdown = shutdown_rx.clone();
            let name = "link-dispatch".to_string();
            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    loop {
                        crossbeam_channel::select! {
                            recv(ingress_rx.raw()) -> msg => {
                                let Ok(item) = msg else { break };
                                stats.rx_frames.fetch_add(1, Ordering::Relaxed);
                                match registry.get(item.frame.ethertype) {
                                    Ok(handler) => handler.receive(item.frame, &item.dev),
                                    Err(e) => {
                                        stats.dropped_no_protocol.fetch_add(1, Ordering::Relaxed);
                                        debug!(dev = %item.dev.name(), error = %e, "frame dropped");
                                    }
                                }
                            }
                            recv(shutdown) -> _ => break,
                        }
                    }
                    debug!("inbound dispatch stopped");
                })
                .map_err(|e| ConfigError::Spawn { name, source: e })?;
            threads.push(thread);
        }

        // Outbound dispatch: hand each request to the protocol that owns
        // its encapsulation.
        {
            let registry = registry.clone();
            let stats = stats.clone();
            let shutdown = shutdown_rx.clone();
            let name = "link-egress".to_string();
            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    loop {
                        crossbeam_channel::select! {
                            recv(outbound_rx.raw()) -> msg => {
                                let Ok(request) = msg else { break };
                                match registry.get(request.ethertype) {
                                    Ok(handler) => handler.send(request),
                                    Err(e) => {
                                        stats.dropped_no_protocol.fetch_add(1, Ordering::Relaxed);
                                        debug!(error = %e, "send request dropped");
                                    }
                                }
                            }
                            recv(shutdown) -> _ => break,
                        }
                    }
                    debug!("outbound dispatch stopped");
                })
                .map_err(|e| ConfigError::Spawn { name, source: e })?;
            threads.push(thread);
        }

        // Retry clock for unanswered resolution requests.
        {
            let neighbors = neighbors.clone();
            let period = (self.neighbor_config.retry_timeout / 2).max(Duration::from_millis(50));
            let ticker = tick(period);
            let shutdown = shutdown_rx;
            let name = "link-neigh-timer".to_string();
            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    loop {
                        crossbeam_channel::select! {
                            recv(ticker) -> _ => neighbors.sweep(),
                            recv(shutdown) -> _ => break,
                        }
                    }
                })
                .map_err(|e| ConfigError::Spawn { name, source: e })?;
            threads.push(thread);
        }

        info!(
            devices = handles.len(),
            protocols = registry.len(),
            "link layer started"
        );

        Ok(LinkLayer {
            outbound: outbound_tx,
            delivery: Some(delivery_rx),
            devices: handles,
            raw_devices: self.devices,
            routes,
            neighbors,
            registry,
            stats,
            shutdown: Some(shutdown_tx),
            threads,
        })
    }
}

/// A running link layer.
pub struct LinkLayer {
    outbound: QueueTx<SendRequest>,
    delivery: Option<QueueRx<Delivery>>,
    devices: HashMap<String, DeviceHandle>,
    raw_devices: Vec<Arc<dyn Device>>,
    routes: RoutingTable,
    neighbors: Arc<NeighborCache>,
    registry: Arc<ProtocolRegistry>,
    stats: Arc<LinkStats>,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

// Manual `Debug` impl: several fields (e.g. `Vec<Arc<dyn Device>>`) are trait
// objects that cannot participate in a `#[derive(Debug)]`. Test code relies on
// `LinkLayer: Debug` (via `Result::unwrap_err`), so provide a minimal one.
impl std::fmt::Debug for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLayer")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("running", &!self.threads.is_empty())
            .finish_non_exhaustive()
    }
}

impl LinkLayer {
    pub fn builder() -> LinkLayerBuilder {
        LinkLayerBuilder::new()
    }

    /// Queue a payload for transmission. Blocks only while the outbound
    /// queue is full.
    pub fn send(&self, request: SendRequest) -> Result<(), Closed> {
        self.outbound.push(request)
    }

    /// A producer endpoint for the outbound queue, for layers above that
    /// run their own workers.
    pub fn sender(&self) -> QueueTx<SendRequest> {
        self.outbound.clone()
    }

    /// Pop the next decapsulated payload, blocking until one arrives.
    pub fn recv(&self) -> Result<Delivery, Closed> {
        match &self.delivery {
            Some(rx) => rx.pop(),
            None => Err(Closed),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, Closed> {
        match &self.delivery {
            Some(rx) => rx.pop_timeout(timeout),
            None => Err(Closed),
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.values()
    }

    /// The routing table, for startup code to populate (connected routes,
    /// default route, statics).
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn neighbors(&self) -> &NeighborCache {
        &self.neighbors
    }

    /// Look up a registered protocol handler.
    pub fn protocol(&self, ethertype: EthernetProtocol) -> Result<&dyn LinkProtocol, LinkError> {
        self.registry.get(ethertype)
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    fn begin_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            info!("link layer shutting down");
            drop(tx);
            // Closing the delivery queue unblocks a dispatch loop that is
            // mid-push toward a consumer that is no longer coming.
            self.delivery.take();
            for dev in &self.raw_devices {
                dev.close();
            }
        }
    }

    /// Stop every worker and wait for them. Queues close; workers observe
    /// closure at their next queue operation and exit.
    pub fn shutdown(mut self) {
        self.begin_shutdown();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("link worker panicked during shutdown");
            }
        }
    }
}

impl Drop for LinkLayer {
    fn drop(&mut self) {
        self.begin_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Loopback;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn duplicate_device_name_rejected() {
        let err = LinkLayer::builder()
            .device(Loopback::new())
            .device(Loopback::new())
            .start()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice(name) if name == "lo"));
    }

    #[test]
    fn starts_and_shuts_down_cleanly() {
        let layer = LinkLayer::builder().device(Loopback::new()).start().unwrap();
        assert!(layer.device("lo").is_some());
        assert!(layer.protocol(EthernetProtocol::Ipv4).is_ok());
        assert!(layer.protocol(EthernetProtocol::Arp).is_ok());
        layer.shutdown();
    }

    #[test]
    fn loopback_round_trip() {
        let layer = LinkLayer::builder().device(Loopback::new()).start().unwrap();
        let lo = layer.device("lo").unwrap().clone();
        layer.routes().add_connected_routes(&lo);

        layer
            .send(SendRequest::ipv4(ip("127.0.0.1"), vec![1, 2, 3]))
            .unwrap();

        let delivery = layer
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("payload should come back around");
        assert_eq!(delivery.payload, vec![1, 2, 3]);
        assert_eq!(delivery.device, "lo");

        layer.shutdown();
    }

    #[test]
    fn send_without_route_counts_drop() {
        let layer = LinkLayer::builder().device(Loopback::new()).start().unwrap();
        layer
            .send(SendRequest::ipv4(ip("203.0.113.5"), vec![9]))
            .unwrap();

        // The drop is asynchronous; poll the counter briefly.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while layer.stats().snapshot().dropped_no_route == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(layer.stats().snapshot().dropped_no_route, 1);
        layer.shutdown();
    }
}
