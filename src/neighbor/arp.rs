//! ARP: the IPv4-over-Ethernet resolution protocol.
//!
//! Two halves. [`ArpResolver`] is the outbound half registered with the
//! neighbor cache — it puts request and reply packets on the wire.
//! [`ArpIngress`] is the inbound half registered with the protocol
//! registry — it parses ARP frames off the dispatch loop and feeds them
//! into the cache.

use super::{AddressFamily, NeighborCache, NeighborResolver};
use crate::device::DeviceHandle;
use crate::frame::{Frame, SendRequest};
use crate::registry::LinkProtocol;
use crate::stats::LinkStats;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

fn emit_arp(repr: &ArpRepr) -> Vec<u8> {
    let mut buffer = vec![0u8; repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut buffer);
    repr.emit(&mut packet);
    buffer
}

/// Outbound ARP exchange for one device's traffic.
pub struct ArpResolver;

impl NeighborResolver for ArpResolver {
    fn family(&self) -> AddressFamily {
        AddressFamily::Ipv4
    }

    fn send_request(&self, dev: &DeviceHandle, target: Ipv4Addr) {
        let Some(src) = dev.source_addr_for(target) else {
            debug!(dev = %dev.name(), %target, "no interface address to request from");
            return;
        };
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: dev.link_addr(),
            source_protocol_addr: Ipv4Address::from(src.addr()),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: Ipv4Address::from(target),
        };
        let frame = Frame::new(
            EthernetAddress::BROADCAST,
            dev.link_addr(),
            EthernetProtocol::Arp,
            emit_arp(&repr),
        );
        if dev.transmit(frame).is_err() {
            debug!(dev = %dev.name(), "egress queue closed, request dropped");
        }
    }

    fn send_reply(
        &self,
        dev: &DeviceHandle,
        target: Ipv4Addr,
        requester_ip: Ipv4Addr,
        requester_mac: EthernetAddress,
    ) {
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: dev.link_addr(),
            source_protocol_addr: Ipv4Address::from(target),
            target_hardware_addr: requester_mac,
            target_protocol_addr: Ipv4Address::from(requester_ip),
        };
        let frame = Frame::new(
            requester_mac,
            dev.link_addr(),
            EthernetProtocol::Arp,
            emit_arp(&repr),
        );
        if dev.transmit(frame).is_err() {
            debug!(dev = %dev.name(), "egress queue closed, reply dropped");
        }
    }
}

/// Inbound ARP handler: demultiplexed frames land here and update the
/// neighbor cache.
pub struct ArpIngress {
    neighbors: Arc<NeighborCache>,
    stats: Arc<LinkStats>,
}

impl ArpIngress {
    pub fn new(neighbors: Arc<NeighborCache>, stats: Arc<LinkStats>) -> Self {
        ArpIngress { neighbors, stats }
    }
}

impl LinkProtocol for ArpIngress {
    fn ethertype(&self) -> EthernetProtocol {
        EthernetProtocol::Arp
    }

    fn receive(&self, frame: Frame, ingress: &DeviceHandle) {
        let repr = match ArpPacket::new_checked(frame.payload.as_slice())
            .and_then(|packet| ArpRepr::parse(&packet))
        {
            Ok(repr) => repr,
            Err(_) => {
                self.stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                debug!(dev = %ingress.name(), "dropping malformed arp packet");
                return;
            }
        };

        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            debug!(dev = %ingress.name(), "ignoring non-ethernet/ipv4 arp packet");
            return;
        };

        match operation {
            ArpOperation::Request => self.neighbors.handle_request(
                target_protocol_addr,
                source_protocol_addr,
                source_hardware_addr,
                ingress,
            ),
            ArpOperation::Reply => self
                .neighbors
                .handle_reply(source_protocol_addr, source_hardware_addr),
            _ => {
                debug!(dev = %ingress.name(), "ignoring arp packet with unknown operation");
            }
        }
    }

    fn send(&self, _request: SendRequest) {
        // ARP traffic originates inside the resolver; nothing sensible can
        // arrive here from a layer above.
        debug!("arp handler has no outbound path, request dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InterfaceAddr;
    use crate::neighbor::{NeighborConfig, NeighborStatus, Resolution};
    use crate::queue::{self, QueueRx};

    const DEV_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
    const PEER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x99]);

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn device() -> (DeviceHandle, QueueRx<Frame>) {
        let (tx, rx) = queue::pair(16);
        let dev = DeviceHandle::new(
            "dev0".to_string(),
            DEV_MAC,
            vec![InterfaceAddr::parse("10.0.0.1/24", None).unwrap()],
            tx,
        );
        (dev, rx)
    }

    fn cache() -> (Arc<NeighborCache>, Arc<LinkStats>) {
        let stats = Arc::new(LinkStats::default());
        let mut cache = NeighborCache::new(NeighborConfig::default(), stats.clone());
        cache.add_resolver(Box::new(ArpResolver)).unwrap();
        (Arc::new(cache), stats)
    }

    fn parse_arp(frame: &Frame) -> ArpRepr {
        let packet = ArpPacket::new_checked(frame.payload.as_slice()).unwrap();
        ArpRepr::parse(&packet).unwrap()
    }

    fn arp_frame(
        operation: ArpOperation,
        src_mac: EthernetAddress,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Frame {
        let repr = ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr: src_mac,
            source_protocol_addr: Ipv4Address::from(src_ip),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: Ipv4Address::from(dst_ip),
        };
        Frame::new(
            EthernetAddress::BROADCAST,
            src_mac,
            EthernetProtocol::Arp,
            emit_arp(&repr),
        )
    }

    #[test]
    fn request_goes_out_as_broadcast() {
        let (dev, egress) = device();
        ArpResolver.send_request(&dev, ip("10.0.0.2"));

        let frame = egress.try_pop().unwrap().expect("request on the wire");
        assert_eq!(frame.dst, EthernetAddress::BROADCAST);
        assert_eq!(frame.src, DEV_MAC);
        assert_eq!(frame.ethertype, EthernetProtocol::Arp);
        match parse_arp(&frame) {
            ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Request);
                assert_eq!(source_hardware_addr, DEV_MAC);
                assert_eq!(source_protocol_addr, Ipv4Address::from(ip("10.0.0.1")));
                assert_eq!(target_protocol_addr, Ipv4Address::from(ip("10.0.0.2")));
            }
            _ => unreachable!("parse_arp only yields EthernetIpv4"),
        }
    }

    #[test]
    fn reply_goes_straight_to_requester() {
        let (dev, egress) = device();
        ArpResolver.send_reply(&dev, ip("10.0.0.1"), ip("10.0.0.9"), PEER_MAC);

        let frame = egress.try_pop().unwrap().expect("reply on the wire");
        assert_eq!(frame.dst, PEER_MAC);
        match parse_arp(&frame) {
            ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                target_hardware_addr,
                target_protocol_addr,
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_hardware_addr, DEV_MAC);
                assert_eq!(source_protocol_addr, Ipv4Address::from(ip("10.0.0.1")));
                assert_eq!(target_hardware_addr, PEER_MAC);
                assert_eq!(target_protocol_addr, Ipv4Address::from(ip("10.0.0.9")));
            }
            _ => unreachable!("parse_arp only yields EthernetIpv4"),
        }
    }

    #[test]
    fn ingress_request_for_owned_address_is_answered() {
        let (dev, egress) = device();
        let (cache, stats) = cache();
        let ingress = ArpIngress::new(cache, stats);

        let request = arp_frame(ArpOperation::Request, PEER_MAC, ip("10.0.0.9"), ip("10.0.0.1"));
        ingress.receive(request, &dev);

        let reply = egress.try_pop().unwrap().expect("reply generated");
        assert_eq!(reply.dst, PEER_MAC);
        match parse_arp(&reply) {
            ArpRepr::EthernetIpv4 { operation, .. } => {
                assert_eq!(operation, ArpOperation::Reply)
            }
            _ => unreachable!("parse_arp only yields EthernetIpv4"),
        }
    }

    #[test]
    fn ingress_request_for_foreign_address_is_ignored() {
        let (dev, egress) = device();
        let (cache, stats) = cache();
        let ingress = ArpIngress::new(cache, stats);

        let request = arp_frame(ArpOperation::Request, PEER_MAC, ip("10.0.0.9"), ip("10.0.0.42"));
        ingress.receive(request, &dev);
        assert!(egress.try_pop().unwrap().is_none());
    }

    #[test]
    fn ingress_reply_completes_resolution() {
        let (dev, egress) = device();
        let (cache, stats) = cache();
        let target = ip("10.0.0.2");

        // Park a frame waiting on the target, consuming the request.
        let waiting = Frame::new(
            EthernetAddress::BROADCAST,
            DEV_MAC,
            EthernetProtocol::Ipv4,
            vec![42],
        );
        assert_eq!(cache.resolve(&dev, target, waiting), Resolution::Queued);
        let request = egress.try_pop().unwrap().expect("request issued");
        assert_eq!(request.ethertype, EthernetProtocol::Arp);

        // The peer answers; the parked frame leaves with its MAC.
        let reply = arp_frame(ArpOperation::Reply, PEER_MAC, target, ip("10.0.0.1"));
        let ingress = ArpIngress::new(cache.clone(), stats);
        ingress.receive(reply, &dev);

        let released = egress.try_pop().unwrap().expect("parked frame released");
        assert_eq!(released.payload, vec![42]);
        assert_eq!(released.dst, PEER_MAC);
        assert_eq!(
            cache.status(target),
            Some(NeighborStatus::Reachable {
                link_addr: PEER_MAC,
                stale: false
            })
        );
    }

    #[test]
    fn malformed_arp_is_counted() {
        let (dev, _egress) = device();
        let (cache, stats) = cache();
        let ingress = ArpIngress::new(cache, stats.clone());

        let junk = Frame::new(
            EthernetAddress::BROADCAST,
            PEER_MAC,
            EthernetProtocol::Arp,
            vec![0, 1, 2],
        );
        ingress.receive(junk, &dev);
        assert_eq!(stats.snapshot().dropped_malformed, 1);
    }
}
