// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Inbound frame parser.
//!
//! Walks Ethernet, up to three VLAN tags, an MPLS stack, PPPoE session
//! framing, IPv4/IPv6, UDP/TCP and L2TPv2 data (with inner PPP) down to the
//! innermost transport payload, and looks for a test header at its tail.
//!
//! **Decisions:**
//! - Fragmented IPv4 is rejected; test payloads are never fragmented.
//! - IPv6 extension headers are not followed.
//! - Checksums are not validated; corrupted test packets surface as loss.
//!
//! Safe slice indexing only, via a bounds-checked cursor.

use super::chain::{
    ETH_TYPE_IPV4, ETH_TYPE_IPV6, ETH_TYPE_MPLS, ETH_TYPE_PPPOE_SESSION, ETH_TYPE_QINQ,
    ETH_TYPE_VLAN, L2TP_UDP_PORT, PPP_IPV4, PPP_IPV6,
};
use super::checksum::{IPPROTO_TCP, IPPROTO_UDP};
use super::header::TestHeader;
use crate::collaborators::MacAddr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

const ETH_TYPE_VLAN_9100: u16 = 0x9100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unsupported EtherType {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("unsupported PPP protocol {0:#06x}")]
    UnsupportedPppProtocol(u16),

    #[error("invalid IP version {0}")]
    InvalidIpVersion(u8),

    #[error("unsupported IP protocol {0}")]
    UnsupportedIpProtocol(u8),

    #[error("IPv4 header length too small: {0} bytes")]
    IpHeaderTooSmall(u8),

    #[error("fragmented packet")]
    FragmentedPacket,

    #[error("L2TP control message")]
    L2tpControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    pub id: u16,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MplsLabel {
    pub label: u32,
    pub exp: u8,
    pub ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2tpSession {
    pub tunnel_id: u16,
    pub session_id: u16,
}

/// Innermost network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub tos: u8,
    pub ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportInfo {
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    /// Up to three tags, outermost first
    pub vlans: Vec<VlanTag>,
    /// First two labels of the stack, outermost first
    pub mpls: [Option<MplsLabel>; 2],
    pub pppoe_session_id: Option<u16>,
    pub l2tp: Option<L2tpSession>,
    pub network: NetworkInfo,
    pub transport: TransportInfo,
    pub frame_len: usize,
    pub test_header: Option<TestHeader>,
}

impl ParsedFrame {
    pub fn outer_vlan(&self) -> Option<VlanTag> {
        self.vlans.first().copied()
    }

    pub fn inner_vlan(&self) -> Option<VlanTag> {
        self.vlans.get(1).copied()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ParseError::PacketTooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn peek_u8(&self) -> Result<u8, ParseError> {
        self.data.get(self.pos).copied().ok_or(ParseError::PacketTooShort {
            expected: self.pos + 1,
            actual: self.data.len(),
        })
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

struct Inner<'a> {
    network: NetworkInfo,
    transport: TransportInfo,
    payload: &'a [u8],
    l2tp: Option<L2tpSession>,
}

/// Parse a frame starting at its Ethernet header.
pub fn parse_frame(data: &[u8]) -> Result<ParsedFrame, ParseError> {
    let mut cur = Cursor::new(data);
    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(cur.take(6)?);
    src_mac.copy_from_slice(cur.take(6)?);

    let mut vlans = Vec::new();
    let mut ethertype = cur.u16()?;
    while matches!(ethertype, ETH_TYPE_VLAN | ETH_TYPE_QINQ | ETH_TYPE_VLAN_9100) && vlans.len() < 3 {
        let tci = cur.u16()?;
        vlans.push(VlanTag {
            id: tci & 0x0fff,
            priority: (tci >> 13) as u8,
        });
        ethertype = cur.u16()?;
    }

    let mut mpls = [None, None];
    let mut pppoe_session_id = None;
    let inner = match ethertype {
        ETH_TYPE_MPLS => {
            let mut depth = 0;
            loop {
                let word = cur.u32()?;
                if let Some(slot) = mpls.get_mut(depth) {
                    *slot = Some(MplsLabel {
                        label: word >> 12,
                        exp: ((word >> 9) & 0x7) as u8,
                        ttl: (word & 0xff) as u8,
                    });
                }
                depth += 1;
                if word & 0x100 != 0 {
                    break;
                }
            }
            // No payload type after MPLS; infer from the IP version nibble.
            match cur.peek_u8()? >> 4 {
                4 => parse_ipv4(cur.rest())?,
                6 => parse_ipv6(cur.rest())?,
                version => return Err(ParseError::InvalidIpVersion(version)),
            }
        }
        ETH_TYPE_PPPOE_SESSION => {
            cur.take(2)?;
            pppoe_session_id = Some(cur.u16()?);
            cur.take(2)?;
            let protocol = cur.u16()?;
            parse_ppp_payload(protocol, cur.rest())?
        }
        ETH_TYPE_IPV4 => parse_ipv4(cur.rest())?,
        ETH_TYPE_IPV6 => parse_ipv6(cur.rest())?,
        other => return Err(ParseError::UnsupportedEtherType(other)),
    };

    Ok(ParsedFrame {
        dst_mac,
        src_mac,
        vlans,
        mpls,
        pppoe_session_id,
        l2tp: inner.l2tp,
        network: inner.network,
        transport: inner.transport,
        frame_len: data.len(),
        test_header: TestHeader::find(inner.payload),
    })
}

fn parse_ppp_payload(protocol: u16, data: &[u8]) -> Result<Inner<'_>, ParseError> {
    match protocol {
        PPP_IPV4 => parse_ipv4(data),
        PPP_IPV6 => parse_ipv6(data),
        other => Err(ParseError::UnsupportedPppProtocol(other)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<Inner<'_>, ParseError> {
    let mut cur = Cursor::new(data);
    let version_ihl = cur.u8()?;
    if version_ihl >> 4 != 4 {
        return Err(ParseError::InvalidIpVersion(version_ihl >> 4));
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    if header_len < 20 {
        return Err(ParseError::IpHeaderTooSmall(header_len as u8));
    }
    let tos = cur.u8()?;
    let total_len = usize::from(cur.u16()?);
    cur.take(2)?;
    let flags_offset = cur.u16()?;
    if flags_offset & 0x2000 != 0 || flags_offset & 0x1fff != 0 {
        return Err(ParseError::FragmentedPacket);
    }
    let ttl = cur.u8()?;
    let protocol = cur.u8()?;
    cur.take(2)?;
    let src = Ipv4Addr::from(cur.u32()?);
    let dst = Ipv4Addr::from(cur.u32()?);
    if total_len < header_len || total_len > data.len() {
        return Err(ParseError::PacketTooShort {
            expected: total_len.max(header_len),
            actual: data.len(),
        });
    }
    let network = NetworkInfo {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        tos,
        ttl,
    };
    parse_transport(network, protocol, &data[header_len..total_len])
}

fn parse_ipv6(data: &[u8]) -> Result<Inner<'_>, ParseError> {
    let mut cur = Cursor::new(data);
    let word = cur.u32()?;
    if word >> 28 != 6 {
        return Err(ParseError::InvalidIpVersion((word >> 28) as u8));
    }
    let payload_len = usize::from(cur.u16()?);
    let next_header = cur.u8()?;
    let hop_limit = cur.u8()?;
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(cur.take(16)?);
    dst.copy_from_slice(cur.take(16)?);
    let payload = cur.take(payload_len)?;
    let network = NetworkInfo {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        tos: ((word >> 20) & 0xff) as u8,
        ttl: hop_limit,
    };
    parse_transport(network, next_header, payload)
}

fn parse_transport(network: NetworkInfo, protocol: u8, data: &[u8]) -> Result<Inner<'_>, ParseError> {
    let mut cur = Cursor::new(data);
    match protocol {
        IPPROTO_UDP => {
            let src_port = cur.u16()?;
            let dst_port = cur.u16()?;
            let udp_len = usize::from(cur.u16()?);
            cur.take(2)?;
            if udp_len < 8 || udp_len > data.len() {
                return Err(ParseError::PacketTooShort {
                    expected: udp_len.max(8),
                    actual: data.len(),
                });
            }
            let payload = &data[8..udp_len];
            if src_port == L2TP_UDP_PORT && dst_port == L2TP_UDP_PORT {
                return parse_l2tp(payload);
            }
            Ok(Inner {
                network,
                transport: TransportInfo {
                    protocol,
                    src_port,
                    dst_port,
                },
                payload,
                l2tp: None,
            })
        }
        IPPROTO_TCP => {
            let src_port = cur.u16()?;
            let dst_port = cur.u16()?;
            cur.take(8)?;
            let header_len = usize::from(cur.u8()? >> 4) * 4;
            if header_len < 20 || header_len > data.len() {
                return Err(ParseError::PacketTooShort {
                    expected: header_len.max(20),
                    actual: data.len(),
                });
            }
            Ok(Inner {
                network,
                transport: TransportInfo {
                    protocol,
                    src_port,
                    dst_port,
                },
                payload: &data[header_len..],
                l2tp: None,
            })
        }
        other => Err(ParseError::UnsupportedIpProtocol(other)),
    }
}

fn parse_l2tp(data: &[u8]) -> Result<Inner<'_>, ParseError> {
    let mut cur = Cursor::new(data);
    let flags = cur.u16()?;
    if flags & 0x8000 != 0 {
        return Err(ParseError::L2tpControl);
    }
    if flags & 0x4000 != 0 {
        cur.take(2)?;
    }
    let tunnel_id = cur.u16()?;
    let session_id = cur.u16()?;
    if flags & 0x0800 != 0 {
        cur.take(4)?;
    }
    if flags & 0x0200 != 0 {
        let offset = usize::from(cur.u16()?);
        cur.take(offset)?;
    }
    // Address and control fields are optional.
    let mut protocol = cur.u16()?;
    if protocol == 0xff03 {
        protocol = cur.u16()?;
    }
    let mut inner = parse_ppp_payload(protocol, cur.rest())?;
    inner.l2tp = Some(L2tpSession {
        tunnel_id,
        session_id,
    });
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::chain::{Header, HeaderChain};
    use crate::packet::header::{Direction, HeaderScope, SubType, Timestamp};

    fn test_header(flow_id: u64) -> TestHeader {
        TestHeader {
            sub_type: SubType::Ipv4,
            direction: Direction::Up,
            tos: 0,
            session_id: 5,
            scope: HeaderScope::Unicast {
                ifindex: 1,
                outer_vlan: 10,
                inner_vlan: 20,
            },
            flow_id,
            seq: 3,
            timestamp: Timestamp { sec: 1, nsec: 0 },
        }
    }

    fn ipv4(src: [u8; 4], dst: [u8; 4]) -> Header {
        Header::Ipv4 {
            src: src.into(),
            dst: dst.into(),
            tos: 0x28,
            ttl: 63,
            dont_fragment: false,
        }
    }

    #[test]
    fn test_parse_pppoe_frame_with_vlans() {
        let mut chain = HeaderChain::new();
        chain
            .push(Header::Ethernet { dst: [1; 6], src: [2; 6] })
            .push(Header::Vlan { tpid: ETH_TYPE_QINQ, id: 10, priority: 3 })
            .push(Header::Vlan { tpid: ETH_TYPE_VLAN, id: 20, priority: 3 })
            .push(Header::PppoeSession { session_id: 99 })
            .push(ipv4([100, 64, 0, 1], [10, 0, 0, 1]))
            .push(Header::Udp { src_port: 1000, dst_port: 2000 })
            .push(Header::Test { header: test_header(7), padding: 10 });
        let bytes = chain.encode(0).unwrap().bytes;

        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.outer_vlan(), Some(VlanTag { id: 10, priority: 3 }));
        assert_eq!(frame.inner_vlan().map(|v| v.id), Some(20));
        assert_eq!(frame.pppoe_session_id, Some(99));
        assert_eq!(frame.network.tos, 0x28);
        assert_eq!(frame.network.ttl, 63);
        assert_eq!(frame.transport.src_port, 1000);
        assert_eq!(frame.test_header.map(|h| h.flow_id), Some(7));
        assert_eq!(frame.frame_len, bytes.len());
    }

    #[test]
    fn test_parse_mpls_stack() {
        let mut chain = HeaderChain::new();
        chain
            .push(Header::Ethernet { dst: [1; 6], src: [2; 6] })
            .push(Header::Mpls { label: 100, exp: 2, ttl: 254 })
            .push(Header::Mpls { label: 200, exp: 0, ttl: 64 })
            .push(ipv4([10, 0, 0, 1], [10, 0, 0, 2]))
            .push(Header::Udp { src_port: 1, dst_port: 2 })
            .push(Header::Test { header: test_header(1), padding: 0 });
        let frame = parse_frame(&chain.encode(0).unwrap().bytes).unwrap();
        assert_eq!(frame.mpls[0], Some(MplsLabel { label: 100, exp: 2, ttl: 254 }));
        assert_eq!(frame.mpls[1].map(|l| l.label), Some(200));
    }

    #[test]
    fn test_parse_l2tp_inner_packet() {
        let mut chain = HeaderChain::new();
        chain
            .push(Header::Ethernet { dst: [1; 6], src: [2; 6] })
            .push(ipv4([192, 0, 2, 1], [192, 0, 2, 2]))
            .push(Header::Udp { src_port: L2TP_UDP_PORT, dst_port: L2TP_UDP_PORT })
            .push(Header::L2tpData { tunnel_id: 11, session_id: 12, with_length: false, with_offset: true })
            .push(ipv4([10, 10, 10, 10], [100, 64, 0, 9]))
            .push(Header::Udp { src_port: 3, dst_port: 4 })
            .push(Header::Test { header: test_header(2), padding: 4 });
        let frame = parse_frame(&chain.encode(0).unwrap().bytes).unwrap();
        assert_eq!(frame.l2tp, Some(L2tpSession { tunnel_id: 11, session_id: 12 }));
        assert_eq!(frame.network.dst, IpAddr::V4(Ipv4Addr::new(100, 64, 0, 9)));
        assert_eq!(frame.transport.dst_port, 4);
        assert_eq!(frame.test_header.map(|h| h.flow_id), Some(2));
    }

    #[test]
    fn test_frame_without_test_header() {
        let mut chain = HeaderChain::new();
        chain
            .push(Header::Ethernet { dst: [1; 6], src: [2; 6] })
            .push(ipv4([10, 0, 0, 1], [10, 0, 0, 2]))
            .push(Header::Udp { src_port: 53, dst_port: 53 });
        let frame = parse_frame(&chain.encode(0).unwrap().bytes).unwrap();
        assert!(frame.test_header.is_none());
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(matches!(
            parse_frame(&[0u8; 10]),
            Err(ParseError::PacketTooShort { .. })
        ));
        let mut arp = vec![0u8; 12];
        arp.extend_from_slice(&[0x08, 0x06]);
        arp.extend_from_slice(&[0u8; 28]);
        assert_eq!(parse_frame(&arp), Err(ParseError::UnsupportedEtherType(0x0806)));
    }

    #[test]
    fn test_fragment_rejected() {
        let mut chain = HeaderChain::new();
        chain
            .push(Header::Ethernet { dst: [1; 6], src: [2; 6] })
            .push(ipv4([10, 0, 0, 1], [10, 0, 0, 2]))
            .push(Header::Udp { src_port: 1, dst_port: 2 })
            .push(Header::Test { header: test_header(1), padding: 0 });
        let mut bytes = chain.encode(0).unwrap().bytes;
        bytes[14 + 6] = 0x20;
        assert_eq!(parse_frame(&bytes), Err(ParseError::FragmentedPacket));
    }
}
