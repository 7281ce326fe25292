//! IPv4-over-Ethernet protocol handler.
//!
//! The inbound half strips nothing more — the dispatcher already
//! demultiplexed the frame — it just hands the payload to the layer above.
//! The outbound half is where a payload plus destination address becomes a
//! frame on a wire: routing lookup, source selection, neighbor resolution,
//! encapsulation.

use crate::device::DeviceHandle;
use crate::frame::{Delivery, Frame, SendRequest};
use crate::neighbor::{NeighborCache, Resolution};
use crate::queue::QueueTx;
use crate::registry::LinkProtocol;
use crate::routing::RoutingTable;
use crate::stats::LinkStats;
use smoltcp::wire::{EthernetAddress, EthernetProtocol};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

pub struct EthernetIpv4 {
    routes: RoutingTable,
    neighbors: Arc<NeighborCache>,
    delivery: QueueTx<Delivery>,
    stats: Arc<LinkStats>,
}

impl EthernetIpv4 {
    pub fn new(
        routes: RoutingTable,
        neighbors: Arc<NeighborCache>,
        delivery: QueueTx<Delivery>,
        stats: Arc<LinkStats>,
    ) -> Self {
        EthernetIpv4 {
            routes,
            neighbors,
            delivery,
            stats,
        }
    }
}

impl LinkProtocol for EthernetIpv4 {
    fn ethertype(&self) -> EthernetProtocol {
        EthernetProtocol::Ipv4
    }

    fn receive(&self, frame: Frame, ingress: &DeviceHandle) {
        let delivery = Delivery {
            payload: frame.payload,
            src: frame.src,
            device: ingress.name().to_string(),
        };
        if self.delivery.push(delivery).is_err() {
            debug!(dev = %ingress.name(), "upper layer gone, frame dropped");
            return;
        }
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn send(&self, request: SendRequest) {
        let route = match self.routes.lookup(request.dst) {
            Ok(route) => route,
            Err(e) => {
                self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
                debug!(dst = %request.dst, error = %e, "packet dropped");
                return;
            }
        };

        let next_hop = route.next_hop.resolve_target(request.dst);
        // Destination link address is learned during resolution; until then
        // the frame carries the broadcast placeholder.
        let frame = Frame::new(
            EthernetAddress::BROADCAST,
            route.device.link_addr(),
            EthernetProtocol::Ipv4,
            request.payload,
        );

        match self.neighbors.resolve(&route.device, next_hop, frame) {
            Resolution::Sent => {}
            Resolution::Queued => {
                debug!(dst = %request.dst, %next_hop, "awaiting neighbor resolution");
            }
            Resolution::Dropped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InterfaceAddr;
    use crate::neighbor::{ArpResolver, NeighborConfig, NeighborStatus};
    use crate::queue::{self, QueueRx};
    use std::net::Ipv4Addr;

    const DEV_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
    const PEER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x99]);

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    struct Fixture {
        handler: EthernetIpv4,
        dev: DeviceHandle,
        egress: QueueRx<Frame>,
        delivery_rx: QueueRx<Delivery>,
        neighbors: Arc<NeighborCache>,
        routes: RoutingTable,
        stats: Arc<LinkStats>,
    }

    fn fixture() -> Fixture {
        let stats = Arc::new(LinkStats::default());
        let mut cache = NeighborCache::new(NeighborConfig::default(), stats.clone());
        cache.add_resolver(Box::new(ArpResolver)).unwrap();
        let neighbors = Arc::new(cache);

        let (egress_tx, egress) = queue::pair(16);
        let dev = DeviceHandle::new(
            "tap0".to_string(),
            DEV_MAC,
            vec![InterfaceAddr::parse("192.168.1.1/24", None).unwrap()],
            egress_tx,
        );

        let routes = RoutingTable::new();
        routes.add_connected_routes(&dev);

        let (delivery_tx, delivery_rx) = queue::pair(16);
        let handler =
            EthernetIpv4::new(routes.clone(), neighbors.clone(), delivery_tx, stats.clone());

        Fixture {
            handler,
            dev,
            egress,
            delivery_rx,
            neighbors,
            routes,
            stats,
        }
    }

    #[test]
    fn receive_delivers_payload_upward() {
        let f = fixture();
        let frame = Frame::new(DEV_MAC, PEER_MAC, EthernetProtocol::Ipv4, vec![1, 2, 3]);
        f.handler.receive(frame, &f.dev);

        let delivery = f.delivery_rx.try_pop().unwrap().expect("delivered");
        assert_eq!(delivery.payload, vec![1, 2, 3]);
        assert_eq!(delivery.src, PEER_MAC);
        assert_eq!(delivery.device, "tap0");
        assert_eq!(f.stats.snapshot().delivered, 1);
    }

    #[test]
    fn send_without_route_is_dropped_and_counted() {
        let f = fixture();
        f.handler.send(SendRequest::ipv4(ip("8.8.8.8"), vec![1]));
        assert_eq!(f.stats.snapshot().dropped_no_route, 1);
        assert!(f.egress.try_pop().unwrap().is_none());
    }

    #[test]
    fn send_on_link_triggers_resolution_then_flushes() {
        let f = fixture();
        let dst = ip("192.168.1.50");

        f.handler.send(SendRequest::ipv4(dst, vec![0xaa]));

        // First thing on the wire is the resolution request, not the
        // payload.
        let first = f.egress.try_pop().unwrap().expect("request sent");
        assert_eq!(first.ethertype, EthernetProtocol::Arp);
        assert!(f.egress.try_pop().unwrap().is_none());
        assert!(matches!(
            f.neighbors.status(dst),
            Some(NeighborStatus::Incomplete { pending: 1, .. })
        ));

        // Reply arrives; the payload frame follows with the learned MAC.
        f.neighbors.handle_reply(dst, PEER_MAC);
        let sent = f.egress.try_pop().unwrap().expect("payload sent");
        assert_eq!(sent.ethertype, EthernetProtocol::Ipv4);
        assert_eq!(sent.dst, PEER_MAC);
        assert_eq!(sent.src, DEV_MAC);
        assert_eq!(sent.payload, vec![0xaa]);
    }

    #[test]
    fn send_via_gateway_resolves_gateway_not_destination() {
        let f = fixture();
        let gateway = ip("192.168.1.254");
        f.routes.set_default_route(gateway, &f.dev);

        f.handler.send(SendRequest::ipv4(ip("8.8.8.8"), vec![0xbb]));

        // The resolution target is the gateway.
        assert!(f.neighbors.status(gateway).is_some());
        assert!(f.neighbors.status(ip("8.8.8.8")).is_none());

        f.neighbors.handle_reply(gateway, PEER_MAC);
        // Request frame first, then the routed payload.
        let request = f.egress.try_pop().unwrap().unwrap();
        assert_eq!(request.ethertype, EthernetProtocol::Arp);
        let sent = f.egress.try_pop().unwrap().unwrap();
        assert_eq!(sent.dst, PEER_MAC);
        assert_eq!(sent.payload, vec![0xbb]);
    }

    #[test]
    fn resolved_next_hop_sends_without_queueing() {
        let f = fixture();
        let dst = ip("192.168.1.50");
        f.handler.send(SendRequest::ipv4(dst, vec![1]));
        f.neighbors.handle_reply(dst, PEER_MAC);
        while f.egress.try_pop().unwrap().is_some() {}

        f.handler.send(SendRequest::ipv4(dst, vec![2]));
        let sent = f.egress.try_pop().unwrap().expect("sent directly");
        assert_eq!(sent.payload, vec![2]);
        assert_eq!(sent.dst, PEER_MAC);
    }
}
