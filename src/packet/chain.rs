// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Typed header chain and its single-pass serializer.
//!
//! A builder pushes headers outermost first. Length fields, next-protocol
//! fields, EtherTypes and the MPLS bottom-of-stack bit are all derived from
//! the neighbours while serializing, so no header needs to know what follows
//! it.

use super::checksum::{internet_checksum, PseudoHeader, IPPROTO_TCP, IPPROTO_UDP};
use super::header::{TestHeader, TEST_HEADER_LEN};
use crate::collaborators::MacAddr;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_QINQ: u16 = 0x88a8;
pub const ETH_TYPE_MPLS: u16 = 0x8847;
pub const ETH_TYPE_PPPOE_SESSION: u16 = 0x8864;
pub const PPP_IPV4: u16 = 0x0021;
pub const PPP_IPV6: u16 = 0x0057;
pub const L2TP_UDP_PORT: u16 = 1701;
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
/// Default TCP flags of raw TCP streams
pub const TCP_FLAG_ACK: u8 = 0x10;
const IPV4_DF: u16 = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Ethernet {
        dst: MacAddr,
        src: MacAddr,
    },
    Vlan {
        tpid: u16,
        id: u16,
        priority: u8,
    },
    Mpls {
        label: u32,
        exp: u8,
        ttl: u8,
    },
    PppoeSession {
        session_id: u16,
    },
    L2tpData {
        tunnel_id: u16,
        session_id: u16,
        with_length: bool,
        with_offset: bool,
    },
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        tos: u8,
        ttl: u8,
        dont_fragment: bool,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        traffic_class: u8,
        hop_limit: u8,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: u8,
    },
    Test {
        header: TestHeader,
        padding: usize,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("{outer} cannot carry {inner}")]
    Unsupported {
        outer: &'static str,
        inner: &'static str,
    },
    #[error("{0} must be followed by another header")]
    Truncated(&'static str),
    #[error("transport header without enclosing IP header")]
    NoNetworkLayer,
    #[error("{field} overflows at {value} bytes")]
    LengthOverflow { field: &'static str, value: usize },
}

impl Header {
    fn name(&self) -> &'static str {
        match self {
            Header::Ethernet { .. } => "ethernet",
            Header::Vlan { .. } => "vlan",
            Header::Mpls { .. } => "mpls",
            Header::PppoeSession { .. } => "pppoe",
            Header::L2tpData { .. } => "l2tp",
            Header::Ipv4 { .. } => "ipv4",
            Header::Ipv6 { .. } => "ipv6",
            Header::Udp { .. } => "udp",
            Header::Tcp { .. } => "tcp",
            Header::Test { .. } => "test-header",
        }
    }

    fn is_link(&self) -> bool {
        matches!(self, Header::Ethernet { .. } | Header::Vlan { .. })
    }

    fn ethertype(&self) -> Option<u16> {
        match self {
            Header::Mpls { .. } => Some(ETH_TYPE_MPLS),
            Header::PppoeSession { .. } => Some(ETH_TYPE_PPPOE_SESSION),
            Header::Ipv4 { .. } => Some(ETH_TYPE_IPV4),
            Header::Ipv6 { .. } => Some(ETH_TYPE_IPV6),
            _ => None,
        }
    }

    fn ppp_protocol(&self) -> Option<u16> {
        match self {
            Header::Ipv4 { .. } => Some(PPP_IPV4),
            Header::Ipv6 { .. } => Some(PPP_IPV6),
            _ => None,
        }
    }

    fn ip_protocol(&self) -> Option<u8> {
        match self {
            Header::Udp { .. } => Some(IPPROTO_UDP),
            Header::Tcp { .. } => Some(IPPROTO_TCP),
            _ => None,
        }
    }

    /// Bytes this header occupies given its successor
    fn wire_len(&self, next: Option<&Header>) -> usize {
        let ethertype = if next.is_some_and(|n| matches!(n, Header::Vlan { .. })) {
            0
        } else {
            2
        };
        match self {
            Header::Ethernet { .. } => 12 + ethertype,
            Header::Vlan { .. } => 4 + ethertype,
            Header::Mpls { .. } => 4,
            Header::PppoeSession { .. } => 8,
            Header::L2tpData {
                with_length,
                with_offset,
                ..
            } => 6 + 2 * usize::from(*with_length) + 2 * usize::from(*with_offset) + 4,
            Header::Ipv4 { .. } => 20,
            Header::Ipv6 { .. } => 40,
            Header::Udp { .. } => 8,
            Header::Tcp { .. } => 20,
            Header::Test { padding, .. } => padding + TEST_HEADER_LEN,
        }
    }
}

/// Location of the innermost transport header, for send-time checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSpan {
    pub offset: usize,
    pub protocol: u8,
    pub pseudo: PseudoHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub transport: Option<TransportSpan>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderChain {
    headers: Vec<Header>,
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn checked_u16(field: &'static str, value: usize) -> Result<u16, ChainError> {
    u16::try_from(value).map_err(|_| ChainError::LengthOverflow { field, value })
}

impl HeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: Header) -> &mut Self {
        self.headers.push(header);
        self
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Serialize into a buffer with at least `capacity` bytes reserved.
    pub fn encode(&self, capacity: usize) -> Result<EncodedFrame, ChainError> {
        let n = self.headers.len();
        let lens: Vec<usize> = (0..n)
            .map(|i| self.headers[i].wire_len(self.headers.get(i + 1)))
            .collect();
        // remaining[i] = bytes after header i
        let mut remaining = vec![0usize; n];
        for i in (0..n.saturating_sub(1)).rev() {
            remaining[i] = remaining[i + 1] + lens[i + 1];
        }
        let total: usize = lens.iter().sum();

        let mut out = Vec::with_capacity(capacity.max(total));
        let mut pseudo: Option<PseudoHeader> = None;
        let mut transport = None;

        for (i, header) in self.headers.iter().enumerate() {
            let next = self.headers.get(i + 1);
            let payload = remaining[i];
            match header {
                Header::Ethernet { dst, src } => {
                    out.extend_from_slice(dst);
                    out.extend_from_slice(src);
                }
                Header::Vlan { tpid, id, priority } => {
                    put_u16(&mut out, *tpid);
                    put_u16(&mut out, (u16::from(*priority & 0x7) << 13) | (id & 0x0fff));
                }
                Header::Mpls { label, exp, ttl } => {
                    let bottom = !matches!(next, Some(Header::Mpls { .. }));
                    let word = (label & 0xf_ffff) << 12
                        | u32::from(exp & 0x7) << 9
                        | u32::from(bottom) << 8
                        | u32::from(*ttl);
                    out.extend_from_slice(&word.to_be_bytes());
                }
                Header::PppoeSession { session_id } => {
                    let protocol = self.ppp_protocol_after(header, next)?;
                    out.extend_from_slice(&[0x11, 0x00]);
                    put_u16(&mut out, *session_id);
                    put_u16(&mut out, checked_u16("pppoe length", payload + 2)?);
                    put_u16(&mut out, protocol);
                }
                Header::L2tpData {
                    tunnel_id,
                    session_id,
                    with_length,
                    with_offset,
                } => {
                    let protocol = self.ppp_protocol_after(header, next)?;
                    let mut flags = 0x0002u16;
                    if *with_length {
                        flags |= 0x4000;
                    }
                    if *with_offset {
                        flags |= 0x0200;
                    }
                    put_u16(&mut out, flags);
                    if *with_length {
                        put_u16(&mut out, checked_u16("l2tp length", lens[i] + payload)?);
                    }
                    put_u16(&mut out, *tunnel_id);
                    put_u16(&mut out, *session_id);
                    if *with_offset {
                        put_u16(&mut out, 0);
                    }
                    out.extend_from_slice(&[0xff, 0x03]);
                    put_u16(&mut out, protocol);
                }
                Header::Ipv4 {
                    src,
                    dst,
                    tos,
                    ttl,
                    dont_fragment,
                } => {
                    let protocol = self.ip_protocol_after(header, next)?;
                    let start = out.len();
                    out.extend_from_slice(&[0x45, *tos]);
                    put_u16(&mut out, checked_u16("ipv4 total length", 20 + payload)?);
                    put_u16(&mut out, 0);
                    put_u16(&mut out, if *dont_fragment { IPV4_DF } else { 0 });
                    out.extend_from_slice(&[*ttl, protocol, 0, 0]);
                    out.extend_from_slice(&src.octets());
                    out.extend_from_slice(&dst.octets());
                    let checksum = internet_checksum(&out[start..]);
                    out[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
                    pseudo = Some(PseudoHeader::V4 { src: *src, dst: *dst });
                }
                Header::Ipv6 {
                    src,
                    dst,
                    traffic_class,
                    hop_limit,
                } => {
                    let protocol = self.ip_protocol_after(header, next)?;
                    let word = 6u32 << 28 | u32::from(*traffic_class) << 20;
                    out.extend_from_slice(&word.to_be_bytes());
                    put_u16(&mut out, checked_u16("ipv6 payload length", payload)?);
                    out.extend_from_slice(&[protocol, *hop_limit]);
                    out.extend_from_slice(&src.octets());
                    out.extend_from_slice(&dst.octets());
                    pseudo = Some(PseudoHeader::V6 { src: *src, dst: *dst });
                }
                Header::Udp { src_port, dst_port } => {
                    let pseudo = pseudo.ok_or(ChainError::NoNetworkLayer)?;
                    transport = Some(TransportSpan {
                        offset: out.len(),
                        protocol: IPPROTO_UDP,
                        pseudo,
                    });
                    put_u16(&mut out, *src_port);
                    put_u16(&mut out, *dst_port);
                    put_u16(&mut out, checked_u16("udp length", 8 + payload)?);
                    put_u16(&mut out, 0);
                }
                Header::Tcp {
                    src_port,
                    dst_port,
                    flags,
                } => {
                    let pseudo = pseudo.ok_or(ChainError::NoNetworkLayer)?;
                    transport = Some(TransportSpan {
                        offset: out.len(),
                        protocol: IPPROTO_TCP,
                        pseudo,
                    });
                    put_u16(&mut out, *src_port);
                    put_u16(&mut out, *dst_port);
                    out.extend_from_slice(&[0; 8]);
                    out.extend_from_slice(&[0x50, *flags & 0x3f]);
                    put_u16(&mut out, 0xffff);
                    out.extend_from_slice(&[0; 4]);
                }
                Header::Test { header, padding } => {
                    out.resize(out.len() + padding, 0);
                    let at = out.len();
                    out.resize(at + TEST_HEADER_LEN, 0);
                    header.encode(&mut out[at..]);
                }
            }

            if header.is_link() && !matches!(next, Some(Header::Vlan { .. })) {
                let next = next.ok_or(ChainError::Truncated(header.name()))?;
                let ethertype = next.ethertype().ok_or(ChainError::Unsupported {
                    outer: header.name(),
                    inner: next.name(),
                })?;
                put_u16(&mut out, ethertype);
            }
        }

        Ok(EncodedFrame {
            bytes: out,
            transport,
        })
    }

    fn ppp_protocol_after(&self, header: &Header, next: Option<&Header>) -> Result<u16, ChainError> {
        let next = next.ok_or(ChainError::Truncated(header.name()))?;
        next.ppp_protocol().ok_or(ChainError::Unsupported {
            outer: header.name(),
            inner: next.name(),
        })
    }

    fn ip_protocol_after(&self, header: &Header, next: Option<&Header>) -> Result<u8, ChainError> {
        let next = next.ok_or(ChainError::Truncated(header.name()))?;
        next.ip_protocol().ok_or(ChainError::Unsupported {
            outer: header.name(),
            inner: next.name(),
        })
    }
}
