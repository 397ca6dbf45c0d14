// SPDX-License-Identifier: Apache-2.0 OR MIT
//! RFC 1071 Internet checksum and transport pseudo-headers.

use std::net::{Ipv4Addr, Ipv6Addr};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Addresses of the IP header enclosing a transport segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

/// One's complement sum of big-endian 16-bit words, odd tail zero padded.
pub fn ones_sum(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(ones_sum(data, 0))
}

impl PseudoHeader {
    fn sum(&self, protocol: u8, length: usize) -> u32 {
        let addresses = match self {
            PseudoHeader::V4 { src, dst } => ones_sum(&dst.octets(), ones_sum(&src.octets(), 0)),
            PseudoHeader::V6 { src, dst } => ones_sum(&dst.octets(), ones_sum(&src.octets(), 0)),
        };
        let length = length as u32;
        addresses + (length >> 16) + (length & 0xffff) + u32::from(protocol)
    }
}

/// Checksum of a UDP or TCP segment whose checksum field is already zero.
///
/// A UDP result of zero is transmitted as 0xffff.
pub fn transport_checksum(pseudo: &PseudoHeader, protocol: u8, segment: &[u8]) -> u16 {
    let checksum = fold(ones_sum(segment, pseudo.sum(protocol, segment.len())));
    if checksum == 0 && protocol == IPPROTO_UDP {
        0xffff
    } else {
        checksum
    }
}
