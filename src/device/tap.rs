//! Linux TAP device.
//!
//! A TAP interface carries whole Ethernet frames between this process and
//! the kernel. Creation and teardown go through `/dev/net/tun` ioctls; the
//! fd is kept non-blocking and reads poll with a short timeout so a close
//! can interrupt a waiting reader.

use super::{Device, InterfaceAddr};
use nix::libc;
use smoltcp::wire::EthernetAddress;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// TAP flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Poll granularity for cancellable reads.
const POLL_INTERVAL_MS: libc::c_int = 250;

/// ifreq structure for TAP device configuration
#[repr(C)]
#[derive(Debug)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

fn ifreq_for(name: &str, flags: libc::c_short) -> io::Result<IfReq> {
    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: flags,
        _pad: [0; 22],
    };
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device name too long",
        ));
    }
    for (i, &b) in bytes.iter().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    Ok(ifr)
}

/// A kernel-backed TAP interface.
pub struct TapDevice {
    name: String,
    link_addr: EthernetAddress,
    addrs: Vec<InterfaceAddr>,
    file: File,
    closed: AtomicBool,
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`. The fd is opened
    /// non-blocking; Ethernet frames pass with no packet-information
    /// header.
    pub fn create(
        name: &str,
        link_addr: EthernetAddress,
        addrs: Vec<InterfaceAddr>,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let ifr = ifreq_for(name, IFF_TAP | IFF_NO_PI)?;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TAP device created");

        Ok(TapDevice {
            name: name.to_string(),
            link_addr,
            addrs,
            file,
            closed: AtomicBool::new(false),
        })
    }

    /// Set IFF_UP on the interface so the kernel starts passing frames.
    /// Address and route configuration on the kernel side stays with the
    /// operator.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = SockGuard(sock);

        let mut ifr = ifreq_for(&self.name, 0)?;

        // SIOCGIFFLAGS then SIOCSIFFLAGS with IFF_UP added.
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name = %self.name, "interface set UP");
        Ok(())
    }

    /// Wait until the fd is ready for `events`, re-checking the closed flag
    /// at poll granularity.
    fn wait_ready(&self, events: libc::c_short) -> io::Result<()> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
            }
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
            match ret {
                0 => continue, // timeout, re-check closed flag
                n if n > 0 => return Ok(()),
                _ => {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Device for TapDevice {
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
        loop {
            self.wait_ready(libc::POLLIN)?;
            match (&self.file).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        loop {
            self.wait_ready(libc::POLLOUT)?;
            match (&self.file).write(frame) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// RAII guard for the flags-ioctl socket fd.
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_name() {
        let err = ifreq_for(
            "a-device-name-well-beyond-ifnamsiz",
            IFF_TAP | IFF_NO_PI,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn ifreq_name_is_nul_terminated() {
        let ifr = ifreq_for("tap0", IFF_TAP).unwrap();
        assert_eq!(ifr.ifr_name[0] as u8, b't');
        assert_eq!(ifr.ifr_name[4], 0);
    }

    // Creating a real TAP device needs CAP_NET_ADMIN; covered by manual
    // runs, not unit tests.
}
