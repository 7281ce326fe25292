//! Loopback device.
//!
//! Frames written to the device come straight back out of its reader, so
//! traffic addressed to a local address (including the address-resolution
//! exchange for it) takes the same path as any other device's traffic.

use super::{Device, InterfaceAddr};
use crossbeam_channel::{Receiver, Sender, bounded};
use smoltcp::wire::EthernetAddress;
use std::io;
use std::sync::Mutex;

/// How many frames the loopback buffers between writer and reader.
const LOOPBACK_DEPTH: usize = 64;

/// In-memory device that echoes every written frame back to its reader.
pub struct Loopback {
    name: String,
    addrs: Vec<InterfaceAddr>,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl Loopback {
    /// Standard loopback: `lo` with `127.0.0.1/8`.
    pub fn new() -> Self {
        let addr = InterfaceAddr::parse("127.0.0.1/8", None)
            .expect("loopback address literal is well-formed");
        Loopback::with_config("lo", vec![addr])
    }

    pub fn with_config(name: &str, addrs: Vec<InterfaceAddr>) -> Self {
        let (tx, rx) = bounded(LOOPBACK_DEPTH);
        Loopback {
            name: name.to_string(),
            addrs,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Loopback::new()
    }
}

impl Device for Loopback {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_addr(&self) -> EthernetAddress {
        // The loopback medium has no hardware address.
        EthernetAddress([0; 6])
    }

    fn addrs(&self) -> &[InterfaceAddr] {
        &self.addrs
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rx = self.rx.lock().unwrap();
        let frame = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed"))?;
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
        let tx = self.tx.lock().unwrap();
        let tx = tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed"))?;
        tx.send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed"))?;
        Ok(frame.len())
    }

    fn close(&self) {
        // Dropping the sender wakes a reader blocked in recv.
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_frames_in_order() {
        let lo = Loopback::new();
        lo.write_frame(b"first").unwrap();
        lo.write_frame(b"second").unwrap();

        let mut buf = [0u8; 32];
        let n = lo.read_frame(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = lo.read_frame(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn close_unblocks_reader() {
        use std::sync::Arc;
        let lo = Arc::new(Loopback::new());
        let reader = {
            let lo = lo.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 32];
                lo.read_frame(&mut buf)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        lo.close();
        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_after_close_fails() {
        let lo = Loopback::new();
        lo.close();
        assert!(lo.write_frame(b"frame").is_err());
    }

    #[test]
    fn default_addrs() {
        let lo = Loopback::new();
        assert_eq!(lo.name(), "lo");
        assert_eq!(lo.addrs().len(), 1);
        assert!(lo.addrs()[0].contains("127.0.0.53".parse().unwrap()));
    }
}
