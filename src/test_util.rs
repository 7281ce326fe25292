//! Test support: in-memory devices for exercising the stack without an OS
//! interface.

use crate::device::{Device, InterfaceAddr};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use smoltcp::wire::EthernetAddress;
use std::io;
use std::sync::Mutex;

/// Frames buffered per direction on a test wire.
const WIRE_DEPTH: usize = 64;

/// Identity of one cable end.
pub struct WireEnd {
    pub name: String,
    pub link_addr: EthernetAddress,
    pub addrs: Vec<InterfaceAddr>,
}

impl WireEnd {
    pub fn new(name: &str, link_addr: [u8; 6], addr: &str) -> Self {
        WireEnd {
            name: name.to_string(),
            link_addr: EthernetAddress(link_addr),
            addrs: vec![
                InterfaceAddr::parse(addr, None).expect("test address literal is well-formed"),
            ],
        }
    }
}

/// One end of an in-memory Ethernet cable. Frames written here come out of
/// the peer's reader, and vice versa. Closing an end wakes its own blocked
/// reader — each end belongs to a different layer, which can only close
/// its own devices.
pub struct WireDevice {
    name: String,
    link_addr: EthernetAddress,
    addrs: Vec<InterfaceAddr>,
    to_peer: Mutex<Option<Sender<Vec<u8>>>>,
    from_peer: Mutex<Receiver<Vec<u8>>>,
    closed_rx: Receiver<()>,
    closed_tx: Mutex<Option<Sender<()>>>,
}

impl WireDevice {
    fn new(
        end: WireEnd,
        to_peer: Sender<Vec<u8>>,
        from_peer: Receiver<Vec<u8>>,
    ) -> Self {
        let (closed_tx, closed_rx) = bounded(0);
        WireDevice {
            name: end.name,
            link_addr: end.link_addr,
            addrs: end.addrs,
            to_peer: Mutex::new(Some(to_peer)),
            from_peer: Mutex::new(from_peer),
            closed_rx,
            closed_tx: Mutex::new(Some(closed_tx)),
        }
    }
}

/// Create both ends of a cable.
pub fn wire_pair(a: WireEnd, b: WireEnd) -> (WireDevice, WireDevice) {
    let (a_tx, b_rx) = bounded(WIRE_DEPTH);
    let (b_tx, a_rx) = bounded(WIRE_DEPTH);
    (WireDevice::new(a, a_tx, a_rx), WireDevice::new(b, b_tx, b_rx))
}

impl Device for WireDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_addr(&self) -> EthernetAddress {
        self.link_addr
    }

    fn addrs(&self) -> &[InterfaceAddr] {
        &self.addrs
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.from_peer.lock().unwrap();
        let from_peer: &Receiver<Vec<u8>> = &guard;
        let closed: &Receiver<()> = &self.closed_rx;
        let frame = select! {
            recv(from_peer) -> msg => msg
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?,
            recv(closed) -> _ => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
            }
        };
        if frame.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame larger than read buffer",
            ));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        let tx = self.to_peer.lock().unwrap();
        let tx = tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        // A peer that already shut down just swallows the frame, like a
        // cable with nobody listening.
        let _ = tx.send(frame.to_vec());
        Ok(frame.len())
    }

    fn close(&self) {
        self.closed_tx.lock().unwrap().take();
        self.to_peer.lock().unwrap().take();
    }
}
