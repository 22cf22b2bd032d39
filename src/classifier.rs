// Address classification: decides which side of a packet is "local" (the
// host itself, RFC1918 space, link-local scopes, LAN-prefix peers) and which
// is the remote Internet peer. Tables are swapped by the refresh path under
// the write lock; the capture path takes short read locks per query.

use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::RwLock;

/// Standard delegation size handed to residential customers by the large
/// Chinese ISPs; every GUA on the interface is collapsed to this prefix.
pub const GUA_PREFIX_LEN: u8 = 56;

const fn v4(a: u32, b: u32, c: u32, d: u32) -> u32 {
    (a << 24) | (b << 16) | (c << 8) | d
}

// Non-routable IPv4 space, as inclusive (lo, hi) pairs for O(1) membership:
// RFC1918, loopback, link-local, this-network, limited broadcast.
const PRIVATE_V4_RANGES: [(u32, u32); 7] = [
    (v4(10, 0, 0, 0), v4(10, 255, 255, 255)),
    (v4(172, 16, 0, 0), v4(172, 31, 255, 255)),
    (v4(192, 168, 0, 0), v4(192, 168, 255, 255)),
    (v4(127, 0, 0, 0), v4(127, 255, 255, 255)),
    (v4(169, 254, 0, 0), v4(169, 254, 255, 255)),
    (v4(0, 0, 0, 0), v4(0, 255, 255, 255)),
    (v4(255, 255, 255, 255), v4(255, 255, 255, 255)),
];

// fe80::/10, ::1/128, fc00::/7, ff00::/8
const BUILTIN_V6_EXCLUDE: [Ipv6Net; 4] = [
    Ipv6Net::from_raw(0xfe80 << 112, 10),
    Ipv6Net::from_raw(1, 128),
    Ipv6Net::from_raw(0xfc00 << 112, 7),
    Ipv6Net::from_raw(0xff00 << 112, 8),
];

pub fn is_private_v4(ip: u32) -> bool {
    PRIVATE_V4_RANGES.iter().any(|&(lo, hi)| lo <= ip && ip <= hi)
}

/// An IPv6 network stored as its masked integer form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Net {
    network: u128,
    prefix_len: u8,
}

impl Ipv6Net {
    const fn from_raw(network: u128, prefix_len: u8) -> Self {
        Self { network, prefix_len }
    }

    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Self {
        let bits = u128::from(addr);
        let network = if prefix_len == 0 {
            0
        } else {
            bits & (u128::MAX << (128 - prefix_len as u32))
        };
        Self { network, prefix_len }
    }

    /// Parse `"2408:8456:abcd::/56"`. A bare address is treated as /128.
    /// Host bits are zeroed rather than rejected.
    pub fn parse(s: &str) -> Result<Self, anyhow::Error> {
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: Ipv6Addr = addr_part
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid IPv6 address '{}': {}", addr_part, e))?;
        let prefix_len = match len_part {
            Some(l) => {
                let n: u8 = l
                    .trim()
                    .parse()
                    .map_err(|e| anyhow!("invalid prefix length '{}': {}", l, e))?;
                if n > 128 {
                    return Err(anyhow!("prefix length {} out of range", n));
                }
                n
            }
            None => 128,
        };
        Ok(Self::new(addr, prefix_len))
    }

    pub fn contains(&self, addr: u128) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        (addr ^ self.network) >> (128 - self.prefix_len as u32) == 0
    }

    pub fn contains_bytes(&self, addr: &[u8; 16]) -> bool {
        self.contains(u128::from_be_bytes(*addr))
    }
}

impl fmt::Display for Ipv6Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv6Addr::from(self.network), self.prefix_len)
    }
}

/// LAN prefix provenance. Fixed for the lifetime of the process: once any
/// manual prefix was supplied, auto-refresh must never touch the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMode {
    Manual,
    Auto,
}

impl PrefixMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefixMode::Manual => "manual",
            PrefixMode::Auto => "auto-gua-/56",
        }
    }
}

#[derive(Default)]
struct Tables {
    v4_addrs: HashSet<u32>,
    v6_addrs: HashSet<[u8; 16]>,
    lan_prefixes: Vec<Ipv6Net>,
    // String forms cached for diagnostics, updated together with the sets
    v4_strings: Vec<String>,
    v6_strings: Vec<String>,
}

/// Diagnostic snapshot served by the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LocalIpsDiag {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub lan_prefixes: Vec<String>,
    pub mode: &'static str,
}

pub struct Classifier {
    mode: PrefixMode,
    tables: RwLock<Tables>,
}

impl Classifier {
    pub fn new(manual_prefixes: Vec<Ipv6Net>) -> Self {
        let mode = if manual_prefixes.is_empty() {
            PrefixMode::Auto
        } else {
            PrefixMode::Manual
        };
        Self {
            mode,
            tables: RwLock::new(Tables {
                lan_prefixes: manual_prefixes,
                ..Tables::default()
            }),
        }
    }

    pub fn mode(&self) -> PrefixMode {
        self.mode
    }

    /// Private/reserved range or one of the host's own IPv4 addresses.
    pub fn is_local_v4(&self, ip: u32) -> bool {
        if is_private_v4(ip) {
            return true;
        }
        self.tables.read().unwrap().v4_addrs.contains(&ip)
    }

    /// The host itself, a builtin excluded scope, or a LAN-prefix peer.
    pub fn is_local_v6(&self, addr: &[u8; 16]) -> bool {
        let tables = self.tables.read().unwrap();
        if tables.v6_addrs.contains(addr) {
            return true;
        }
        let bits = u128::from_be_bytes(*addr);
        BUILTIN_V6_EXCLUDE.iter().any(|net| net.contains(bits))
            || tables.lan_prefixes.iter().any(|net| net.contains(bits))
    }

    /// LAN prefix membership only; builtin exclusions are deliberately not
    /// consulted. Used for the double-ended intra-LAN drop test.
    pub fn is_in_lan_prefix(&self, addr: &[u8; 16]) -> bool {
        let tables = self.tables.read().unwrap();
        if tables.lan_prefixes.is_empty() {
            return false;
        }
        let bits = u128::from_be_bytes(*addr);
        tables.lan_prefixes.iter().any(|net| net.contains(bits))
    }

    /// Single writer entry point. Swaps the address sets, and the LAN prefix
    /// list when one is supplied; in manual mode the prefix list is fixed
    /// and `lan_prefixes` is ignored. Readers see either the full old state
    /// or the full new state.
    pub fn replace_tables(
        &self,
        v4_addrs: HashSet<u32>,
        v6_addrs: HashSet<[u8; 16]>,
        lan_prefixes: Option<Vec<Ipv6Net>>,
    ) {
        let mut v4_strings: Vec<String> = v4_addrs
            .iter()
            .map(|&ip| std::net::Ipv4Addr::from(ip).to_string())
            .collect();
        v4_strings.sort();
        let mut v6_strings: Vec<String> = v6_addrs
            .iter()
            .map(|b| Ipv6Addr::from(*b).to_string())
            .collect();
        v6_strings.sort();

        let mut tables = self.tables.write().unwrap();
        tables.v4_addrs = v4_addrs;
        tables.v6_addrs = v6_addrs;
        tables.v4_strings = v4_strings;
        tables.v6_strings = v6_strings;
        if self.mode == PrefixMode::Auto {
            if let Some(prefixes) = lan_prefixes {
                tables.lan_prefixes = prefixes;
            }
        }
    }

    pub fn lan_prefixes(&self) -> Vec<Ipv6Net> {
        self.tables.read().unwrap().lan_prefixes.clone()
    }

    /// All known local address strings, for change detection in the refresh
    /// path.
    pub fn local_addr_strings(&self) -> HashSet<String> {
        let tables = self.tables.read().unwrap();
        tables
            .v4_strings
            .iter()
            .chain(tables.v6_strings.iter())
            .cloned()
            .collect()
    }

    pub fn diagnostics(&self) -> LocalIpsDiag {
        let tables = self.tables.read().unwrap();
        LocalIpsDiag {
            ipv4: tables.v4_strings.clone(),
            ipv6: tables.v6_strings.clone(),
            lan_prefixes: tables.lan_prefixes.iter().map(|n| n.to_string()).collect(),
            mode: self.mode.as_str(),
        }
    }
}
