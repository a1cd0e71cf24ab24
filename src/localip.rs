//! Random local-IP picker (§4.I): a background poller snapshots live
//! interfaces once a second; callers round-robin through the snapshot.
//!
//! No pack file enumerates network interfaces, so this reaches for the
//! standard ecosystem crate for the OS facility (`if-addrs`) rather than
//! inventing a hand-rolled `/proc/net` or `getifaddrs` wrapper — the "enrich
//! from the rest of the pack's spirit" case noted in DESIGN.md.

use parking_lot::RwLock;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct LocalIpPicker {
    ipv4: RwLock<Vec<Ipv4Addr>>,
    ipv6_prefixes: RwLock<Vec<(Ipv6Addr, u8)>>,
    v4_counter: AtomicUsize,
    v6_counter: AtomicUsize,
    any_ip: bool,
}

impl LocalIpPicker {
    /// Spawn the interface-watcher task and return a handle to it.
    pub fn spawn(any_ip: bool) -> Arc<Self> {
        let picker = Arc::new(Self {
            ipv4: RwLock::new(Vec::new()),
            ipv6_prefixes: RwLock::new(Vec::new()),
            v4_counter: AtomicUsize::new(0),
            v6_counter: AtomicUsize::new(0),
            any_ip,
        });
        let watched = picker.clone();
        tokio::spawn(async move { watched.poll_loop().await });
        picker
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.refresh() {
                warn!(error = %e, "interface enumeration failed, retrying next poll");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn refresh(&self) -> std::io::Result<()> {
        let interfaces = if_addrs::get_if_addrs()?;
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for iface in interfaces {
            if iface.is_loopback() || is_filtered_interface(&iface.name) {
                continue;
            }
            match iface.addr {
                if_addrs::IfAddr::V4(addr) => v4.push(addr.ip),
                if_addrs::IfAddr::V6(addr) => v6.push((addr.ip, prefix_len_from_netmask(addr.netmask))),
            }
        }

        *self.ipv4.write() = v4;
        *self.ipv6_prefixes.write() = v6;
        Ok(())
    }

    /// Round-robin the next snapshot IPv4 address, if any are live.
    pub fn next_ipv4(&self) -> Option<Ipv4Addr> {
        let list = self.ipv4.read();
        if list.is_empty() {
            return None;
        }
        let idx = self.v4_counter.fetch_add(1, Ordering::Relaxed) % list.len();
        Some(list[idx])
    }

    /// Round-robin the next snapshot IPv6 prefix, randomising the host
    /// suffix when AnyIP mode is enabled.
    pub fn next_ipv6(&self) -> Option<Ipv6Addr> {
        let list = self.ipv6_prefixes.read();
        if list.is_empty() {
            return None;
        }
        let idx = self.v6_counter.fetch_add(1, Ordering::Relaxed) % list.len();
        let (prefix, prefix_len) = list[idx];
        if self.any_ip {
            Some(randomize_host_bits(prefix, prefix_len))
        } else {
            Some(prefix)
        }
    }

    /// Local address matching `dest`'s family; `None` for an unrecognised
    /// network or no live interface of that family.
    pub fn local_addr(&self, network: &str, dest: IpAddr) -> Option<SocketAddr> {
        if network != "tcp" && network != "udp" {
            return None;
        }
        match dest {
            IpAddr::V4(_) => self.next_ipv4().map(|ip| SocketAddr::new(IpAddr::V4(ip), 0)),
            IpAddr::V6(_) => self.next_ipv6().map(|ip| SocketAddr::new(IpAddr::V6(ip), 0)),
        }
    }
}

fn is_filtered_interface(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["docker", "veth", "br-", "tun", "ppp"].iter().any(|prefix| lower.starts_with(prefix))
}

fn prefix_len_from_netmask(mask: Ipv6Addr) -> u8 {
    mask.octets().iter().map(|b| b.count_ones() as u8).sum()
}

/// Randomise the host bits of `prefix`/`prefix_len` with cryptographically
/// random bytes, masking the boundary byte by `8 - hostBits % 8` high bits
/// so the prefix's own bits within that byte are preserved.
fn randomize_host_bits(prefix: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let mut octets = prefix.octets();
    let host_bits = 128u32.saturating_sub(prefix_len as u32);
    let full_bytes = (host_bits / 8) as usize;
    let partial_bits = (host_bits % 8) as u8;

    let mut random = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut random);

    for i in 0..full_bytes.min(16) {
        let idx = 15 - i;
        octets[idx] = random[idx];
    }
    if partial_bits > 0 && full_bytes < 16 {
        let idx = 15 - full_bytes;
        let keep_mask = 0xFFu8 << partial_bits;
        octets[idx] = (octets[idx] & keep_mask) | (random[idx] & !keep_mask);
    }
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_len_from_full_netmask() {
        assert_eq!(prefix_len_from_netmask(Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0)), 64);
    }

    #[test]
    fn randomize_preserves_prefix_bits() {
        let prefix = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0);
        let randomized = randomize_host_bits(prefix, 32);
        assert_eq!(randomized.segments()[0], 0x2001);
        assert_eq!(randomized.segments()[1], 0x0db8);
    }

    #[test]
    fn round_robin_wraps_across_snapshot() {
        let picker = Arc::new(LocalIpPicker {
            ipv4: RwLock::new(vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]),
            ipv6_prefixes: RwLock::new(Vec::new()),
            v4_counter: AtomicUsize::new(0),
            v6_counter: AtomicUsize::new(0),
            any_ip: false,
        });
        let first = picker.next_ipv4().unwrap();
        let second = picker.next_ipv4().unwrap();
        let third = picker.next_ipv4().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
