// Raw packet capture. Owns the AF_PACKET socket bound to the monitored
// interface and drives frames through parse -> classify -> account. Runs on
// a dedicated OS thread so handler latency can never stall the hot path.

use crate::classifier::Classifier;
use crate::frame::{parse_frame, IpPacket};
use crate::stats::{unix_now, Direction, TrafficStats};
use log::{error, info, warn};
use rand::Rng;
use std::ffi::CString;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Kernel default recv buffers overflow under multi-gigabit bursts; ask for
// 32 MiB and log what the kernel actually grants.
const SOCKET_RCVBUF_SIZE: libc::c_int = 32 * 1024 * 1024;
const RECV_BUFFER_LEN: usize = 65535;
const ETH_P_ALL: u16 = 0x0003;

struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    /// AF_PACKET/SOCK_RAW receiving every EtherType on one interface, with
    /// an enlarged receive buffer and a 1 s receive timeout so the loop can
    /// poll its shutdown flag.
    fn open(iface: &str) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                ETH_P_ALL.to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = RawSocket { fd };

        let name = CString::new(iface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_ALL.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                sock.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &SOCKET_RCVBUF_SIZE as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            let mut granted: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            if libc::getsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut granted as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            ) == 0
            {
                info!(
                    "Socket recv buffer: requested={}KB, granted={}KB",
                    SOCKET_RCVBUF_SIZE / 1024,
                    granted / 1024
                );
            }

            let timeout = libc::timeval {
                tv_sec: 1,
                tv_usec: 0,
            };
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
        }

        Ok(sock)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Apply the direction truth table to one parsed packet and account it.
/// Intra-local and transit packets are dropped; for IPv6 a double-ended LAN
/// prefix hit drops the packet before the per-endpoint decision, catching
/// peer traffic inside the delegated prefix that never crossed the uplink.
pub fn account_packet(classifier: &Classifier, stats: &TrafficStats, pkt: &IpPacket, ts: f64) {
    match *pkt {
        IpPacket::V4 { src, dst, .. } => {
            let src_local = classifier.is_local_v4(src);
            let dst_local = classifier.is_local_v4(dst);
            if src_local == dst_local {
                return;
            }
            if src_local {
                let remote = Ipv4Addr::from(dst).to_string();
                stats.add_bytes(Direction::Up, pkt.len(), &remote, ts);
            } else {
                let remote = Ipv4Addr::from(src).to_string();
                stats.add_bytes(Direction::Down, pkt.len(), &remote, ts);
            }
        }
        IpPacket::V6 { ref src, ref dst, .. } => {
            if classifier.is_in_lan_prefix(src) && classifier.is_in_lan_prefix(dst) {
                return;
            }
            let src_local = classifier.is_local_v6(src);
            let dst_local = classifier.is_local_v6(dst);
            if src_local == dst_local {
                return;
            }
            if src_local {
                let remote = Ipv6Addr::from(*dst).to_string();
                stats.add_bytes(Direction::Up, pkt.len(), &remote, ts);
            } else {
                let remote = Ipv6Addr::from(*src).to_string();
                stats.add_bytes(Direction::Down, pkt.len(), &remote, ts);
            }
        }
    }
}

pub struct Capture {
    iface: String,
    classifier: Arc<Classifier>,
    stats: Arc<TrafficStats>,
    running: Arc<AtomicBool>,
}

impl Capture {
    pub fn new(
        iface: String,
        classifier: Arc<Classifier>,
        stats: Arc<TrafficStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            iface,
            classifier,
            stats,
            running,
        }
    }

    /// Capture thread entry point. Falls back to synthetic traffic when the
    /// raw socket cannot be opened, so the dashboard stays demonstrable on
    /// machines without CAP_NET_RAW.
    pub fn run(&self) {
        info!("Starting raw socket capture on interface: {}", self.iface);
        match RawSocket::open(&self.iface) {
            Ok(sock) => {
                info!("Raw socket ready, capturing packets");
                self.capture_loop(&sock);
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                error!("Permission denied opening raw socket: need CAP_NET_RAW or root");
                warn!("Falling back to simulation mode");
                self.simulate();
            }
            Err(e) => {
                error!("Raw socket setup failed on {}: {}", self.iface, e);
                warn!("Falling back to simulation mode");
                self.simulate();
            }
        }
    }

    fn capture_loop(&self, sock: &RawSocket) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        while self.running.load(Ordering::Relaxed) {
            match sock.recv(&mut buf) {
                Ok(n) => {
                    let ts = unix_now();
                    if let Some(pkt) = parse_frame(&buf[..n]) {
                        account_packet(&self.classifier, &self.stats, &pkt, ts);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!("Recv error: {}", e);
                    }
                    break;
                }
            }
        }
    }

    fn simulate(&self) {
        const FAKE_REMOTES: [&str; 10] = [
            "8.8.8.8",
            "1.1.1.1",
            "104.16.0.1",
            "203.0.113.5",
            "2400:3200::1",
            "2001:4860:4860::8888",
            "185.60.216.1",
            "91.108.4.1",
            "13.227.0.1",
            "31.13.70.1",
        ];
        info!("Simulation mode: generating fake traffic (down:up ~ 4:1)");
        let mut rng = rand::thread_rng();
        while self.running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
            let remote = FAKE_REMOTES[rng.gen_range(0..FAKE_REMOTES.len())];
            let size = rng.gen_range(500..=1460u64);
            let direction = if rng.gen_range(0..5) == 0 {
                Direction::Up
            } else {
                Direction::Down
            };
            self.stats.add_bytes(direction, size, remote, unix_now());
        }
    }
}
