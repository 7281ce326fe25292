//! Link-layer frames and the messages exchanged with the layer above.
//!
//! Byte-level encoding is delegated to `smoltcp::wire`; this module only
//! owns the parsed in-memory representation that travels through the
//! queues. A [`Frame`] has exactly one owner at a time — ownership moves
//! producer to consumer, queue by queue.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use std::net::Ipv4Addr;

/// Largest frame a device worker will read: Ethernet header + 1500 MTU.
pub const MAX_FRAME_LEN: usize = 1514;

/// A parsed Ethernet frame: fixed header fields plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: EthernetAddress,
    pub src: EthernetAddress,
    pub ethertype: EthernetProtocol,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        dst: EthernetAddress,
        src: EthernetAddress,
        ethertype: EthernetProtocol,
        payload: Vec<u8>,
    ) -> Self {
        Frame {
            dst,
            src,
            ethertype,
            payload,
        }
    }

    /// Parse a raw frame as read from a device. `None` on truncated input;
    /// the caller drops and counts.
    pub fn parse(data: &[u8]) -> Option<Frame> {
        let raw = EthernetFrame::new_checked(data).ok()?;
        Some(Frame {
            dst: raw.dst_addr(),
            src: raw.src_addr(),
            ethertype: raw.ethertype(),
            payload: raw.payload().to_vec(),
        })
    }

    /// Serialize for a device write.
    pub fn emit(&self) -> Vec<u8> {
        let repr = EthernetRepr {
            src_addr: self.src,
            dst_addr: self.dst,
            ethertype: self.ethertype,
        };
        let mut buffer = vec![0u8; repr.buffer_len() + self.payload.len()];
        let mut raw = EthernetFrame::new_unchecked(&mut buffer);
        repr.emit(&mut raw);
        raw.payload_mut().copy_from_slice(&self.payload);
        buffer
    }
}

/// What a layer above pushes onto the link layer's outbound queue: a
/// payload, the destination network address, and the protocol id that owns
/// the encapsulation.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub ethertype: EthernetProtocol,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl SendRequest {
    pub fn ipv4(dst: Ipv4Addr, payload: Vec<u8>) -> Self {
        SendRequest {
            ethertype: EthernetProtocol::Ipv4,
            dst,
            payload,
        }
    }
}

/// A decapsulated payload handed to the layer above, with the ingress
/// metadata it needs for its own demultiplexing.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Link address of the sender.
    pub src: EthernetAddress,
    /// Name of the device the frame arrived on.
    pub device: String,
}
