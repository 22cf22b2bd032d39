// Ethernet frame decoding. Extracts the IP-layer declared length and the
// address pair; everything else about the packet is irrelevant to metering.

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_8021Q: u16 = 0x8100;

const ETH_HEADER_LEN: usize = 14;
const VLAN_HEADER_LEN: usize = 18;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_FIXED_HEADER_LEN: usize = 40;

/// One parsed IP packet. `len` is the protocol-declared IP-layer length
/// (IPv4 total length, or 40 + IPv6 payload length), never the captured
/// frame length, so link-layer padding and FCS artifacts do not leak into
/// the byte accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPacket {
    V4 {
        len: u16,
        src: u32,
        dst: u32,
    },
    V6 {
        len: u32,
        src: [u8; 16],
        dst: [u8; 16],
    },
}

impl IpPacket {
    pub fn len(&self) -> u64 {
        match self {
            IpPacket::V4 { len, .. } => *len as u64,
            IpPacket::V6 { len, .. } => *len as u64,
        }
    }
}

fn read_be_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Decode one captured link-layer frame. Handles an optional 802.1Q tag.
/// Runt frames and non-IP EtherTypes yield `None`.
pub fn parse_frame(frame: &[u8]) -> Option<IpPacket> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }

    let mut ethertype = read_be_u16(frame, 12);
    let mut payload_offset = ETH_HEADER_LEN;

    if ethertype == ETH_P_8021Q {
        if frame.len() < VLAN_HEADER_LEN {
            return None;
        }
        ethertype = read_be_u16(frame, 16);
        payload_offset = VLAN_HEADER_LEN;
    }

    let payload = &frame[payload_offset..];
    match ethertype {
        ETH_P_IP => parse_ipv4(payload),
        ETH_P_IPV6 => parse_ipv6(payload),
        _ => None,
    }
}

fn parse_ipv4(data: &[u8]) -> Option<IpPacket> {
    if data.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }
    Some(IpPacket::V4 {
        len: read_be_u16(data, 2),
        src: read_be_u32(data, 12),
        dst: read_be_u32(data, 16),
    })
}

fn parse_ipv6(data: &[u8]) -> Option<IpPacket> {
    if data.len() < IPV6_FIXED_HEADER_LEN {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);
    Some(IpPacket::V6 {
        len: IPV6_FIXED_HEADER_LEN as u32 + read_be_u16(data, 4) as u32,
        src,
        dst,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HEADER_LEN];
        frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4_payload(total_len: u16, src: u32, dst: u32) -> Vec<u8> {
        let mut p = vec![0u8; IPV4_MIN_HEADER_LEN];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&total_len.to_be_bytes());
        p[12..16].copy_from_slice(&src.to_be_bytes());
        p[16..20].copy_from_slice(&dst.to_be_bytes());
        p
    }

    fn ipv6_payload(payload_len: u16, src: [u8; 16], dst: [u8; 16]) -> Vec<u8> {
        let mut p = vec![0u8; IPV6_FIXED_HEADER_LEN];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&payload_len.to_be_bytes());
        p[8..24].copy_from_slice(&src);
        p[24..40].copy_from_slice(&dst);
        p
    }

    #[test]
    fn test_ipv4_uses_declared_length_not_frame_length() {
        let src = u32::from_be_bytes([192, 168, 1, 10]);
        let dst = u32::from_be_bytes([8, 8, 8, 8]);
        let mut frame = eth_frame(ETH_P_IP, &ipv4_payload(1500, src, dst));
        // Ethernet padding must not change the counted size
        frame.extend_from_slice(&[0u8; 32]);

        let pkt = parse_frame(&frame).unwrap();
        assert_eq!(pkt, IpPacket::V4 { len: 1500, src, dst });
        assert_eq!(pkt.len(), 1500);
    }

    #[test]
    fn test_ipv6_length_is_header_plus_payload() {
        let src = [0x24, 0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0x26, 0x06, 0x47, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x11, 0x11];
        let frame = eth_frame(ETH_P_IPV6, &ipv6_payload(1440, src, dst));

        let pkt = parse_frame(&frame).unwrap();
        assert_eq!(pkt.len(), 1480);
        match pkt {
            IpPacket::V6 { src: s, dst: d, .. } => {
                assert_eq!(s, src);
                assert_eq!(d, dst);
            }
            _ => panic!("expected an IPv6 packet"),
        }
    }

    #[test]
    fn test_vlan_tag_reads_inner_ethertype() {
        let src = u32::from_be_bytes([10, 0, 0, 2]);
        let dst = u32::from_be_bytes([1, 1, 1, 1]);
        let mut frame = vec![0u8; VLAN_HEADER_LEN];
        frame[12..14].copy_from_slice(&ETH_P_8021Q.to_be_bytes());
        frame[16..18].copy_from_slice(&ETH_P_IP.to_be_bytes());
        frame.extend_from_slice(&ipv4_payload(74, src, dst));

        let pkt = parse_frame(&frame).unwrap();
        assert_eq!(pkt, IpPacket::V4 { len: 74, src, dst });
    }

    #[test]
    fn test_runt_frames_are_dropped() {
        assert_eq!(parse_frame(&[]), None);
        assert_eq!(parse_frame(&[0u8; 13]), None);

        // VLAN tag present but the frame ends before the inner ethertype
        let mut vlan_runt = vec![0u8; 16];
        vlan_runt[12..14].copy_from_slice(&ETH_P_8021Q.to_be_bytes());
        assert_eq!(parse_frame(&vlan_runt), None);

        // Declared IPv4 but a truncated header
        let frame = eth_frame(ETH_P_IP, &[0u8; 19]);
        assert_eq!(parse_frame(&frame), None);

        // Declared IPv6 but a truncated header
        let frame = eth_frame(ETH_P_IPV6, &[0u8; 39]);
        assert_eq!(parse_frame(&frame), None);
    }

    #[test]
    fn test_unknown_ethertype_is_ignored() {
        // ARP
        let frame = eth_frame(0x0806, &[0u8; 28]);
        assert_eq!(parse_frame(&frame), None);
    }
}
