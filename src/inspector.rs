// Interface address inspection. Reads the addresses currently bound to the
// monitored interface and derives the /56 LAN prefix set from its global
// unicast addresses. The refresh path applies the result to the classifier.

use crate::classifier::{Classifier, Ipv6Net, PrefixMode, GUA_PREFIX_LEN};
use anyhow::{anyhow, Context};
use log::{info, warn};
use std::collections::HashSet;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

/// All addresses currently assigned to `iface`, both families, all scopes,
/// zone identifiers stripped. An empty set means the interface holds no
/// addresses right now; that is not an error. The address table is read via
/// getifaddrs, with `ip -o addr show` as a fallback when that fails.
pub fn detect_local_ips(iface: &str) -> Result<HashSet<IpAddr>, anyhow::Error> {
    match detect_via_getifaddrs(iface) {
        Ok(addrs) => Ok(addrs),
        Err(e) => {
            warn!("getifaddrs failed ({}), falling back to ip command", e);
            detect_via_ip_command(iface)
        }
    }
}

fn detect_via_getifaddrs(iface: &str) -> Result<HashSet<IpAddr>, anyhow::Error> {
    let mut addrs: HashSet<IpAddr> = HashSet::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(anyhow!(std::io::Error::last_os_error()));
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }
            let name = match CStr::from_ptr(ifa.ifa_name).to_str() {
                Ok(s) => s,
                Err(_) => continue,
            };
            if name != iface {
                continue;
            }

            match (*ifa.ifa_addr).sa_family as i32 {
                libc::AF_INET => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip = Ipv4Addr::from(u32::from_be((*sa).sin_addr.s_addr));
                    addrs.insert(IpAddr::V4(ip));
                }
                libc::AF_INET6 => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in6;
                    let ip = Ipv6Addr::from((*sa).sin6_addr.s6_addr);
                    addrs.insert(IpAddr::V6(ip));
                }
                _ => {}
            }
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(addrs)
}

fn detect_via_ip_command(iface: &str) -> Result<HashSet<IpAddr>, anyhow::Error> {
    let output = Command::new("ip")
        .args(["-o", "addr", "show", iface])
        .output()
        .context("failed to run ip addr show")?;
    Ok(parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ip -o addr show <iface>` output: one line per address, with the
/// address following an `inet` or `inet6` token as `addr/plen`.
fn parse_ip_addr_output(output: &str) -> HashSet<IpAddr> {
    let mut addrs = HashSet::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        for i in 0..parts.len() {
            if (parts[i] == "inet" || parts[i] == "inet6") && i + 1 < parts.len() {
                let token = parts[i + 1];
                let bare = token
                    .split('/')
                    .next()
                    .unwrap_or("")
                    .split('%')
                    .next()
                    .unwrap_or("");
                if let Ok(ip) = bare.parse::<IpAddr>() {
                    addrs.insert(ip);
                }
            }
        }
    }
    addrs
}

/// Collapse every global unicast address (2000::/3, first byte 0x20..=0x3F)
/// to its /56 network. Deduplicated, deterministic order.
pub fn derive_gua_prefixes(addrs: &HashSet<IpAddr>) -> Vec<Ipv6Net> {
    let mut guas: Vec<Ipv6Addr> = addrs
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V6(v6) if (v6.octets()[0] & 0xE0) == 0x20 => Some(*v6),
            _ => None,
        })
        .collect();
    guas.sort();

    let mut prefixes: Vec<Ipv6Net> = Vec::new();
    for gua in guas {
        let net = Ipv6Net::new(gua, GUA_PREFIX_LEN);
        if !prefixes.contains(&net) {
            prefixes.push(net);
        }
    }
    prefixes
}

/// One refresh cycle: re-inspect the interface, log any address diff, and
/// swap the classifier tables. In auto mode the /56 prefix list is
/// re-derived when the address set changed, or unconditionally when
/// `force_prefixes` is set (ISP reconnects can move the delegation without
/// a visible address change at the same instant). Inspection failure keeps
/// the previous tables.
pub fn refresh_classifier(classifier: &Classifier, iface: &str, force_prefixes: bool) {
    let addrs = match detect_local_ips(iface) {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("address inspection failed on {}: {}, keeping previous tables", iface, e);
            return;
        }
    };

    let old_strings = classifier.local_addr_strings();
    let new_strings: HashSet<String> = addrs.iter().map(|ip| ip.to_string()).collect();
    let changed = old_strings != new_strings || old_strings.is_empty();

    if changed {
        let mut v4: Vec<String> = addrs
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(|ip| ip.to_string())
            .collect();
        v4.sort();
        let mut v6: Vec<String> = addrs
            .iter()
            .filter(|ip| ip.is_ipv6())
            .map(|ip| ip.to_string())
            .collect();
        v6.sort();
        info!("Local IPs on {} -> IPv4: {:?}, IPv6: {:?}", iface, v4, v6);
        let added: Vec<&String> = new_strings.difference(&old_strings).collect();
        let removed: Vec<&String> = old_strings.difference(&new_strings).collect();
        if !added.is_empty() {
            info!("  + added: {:?}", added);
        }
        if !removed.is_empty() {
            info!("  - removed: {:?}", removed);
        }
    } else if !force_prefixes {
        return;
    }

    let prefixes = if classifier.mode() == PrefixMode::Auto {
        let derived = derive_gua_prefixes(&addrs);
        if derived != classifier.lan_prefixes() {
            if derived.is_empty() {
                warn!(
                    "no GUA found on {}; only builtin IPv6 exclusions remain active",
                    iface
                );
            } else {
                let shown: Vec<String> = derived.iter().map(|n| n.to_string()).collect();
                info!("Auto GUA /{} prefixes updated: {:?}", GUA_PREFIX_LEN, shown);
            }
        }
        Some(derived)
    } else {
        None
    };

    let v4_addrs: HashSet<u32> = addrs
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(u32::from(*v4)),
            _ => None,
        })
        .collect();
    let v6_addrs: HashSet<[u8; 16]> = addrs
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V6(v6) => Some(v6.octets()),
            _ => None,
        })
        .collect();

    classifier.replace_tables(v4_addrs, v6_addrs, prefixes);
}
