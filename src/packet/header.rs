// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Test header codec.
//!
//! Every generated packet ends with a 48-byte little-endian test header,
//! preceded by zero padding that brings the frame up to its configured
//! length:
//!
//! ```text
//!  0  magic       u64   0x5274427269636b21
//!  8  type        u8    1 unicast, 2 multicast
//!  9  sub-type    u8    1 ipv4, 2 ipv6, 3 ipv6pd
//! 10  direction   u8    1 up, 2 down
//! 11  tos         u8
//! 12  session-id  u32
//! 16  ifindex u32, outer vlan u16, inner vlan u16   (unicast)
//!     source u32, group u32                         (multicast)
//! 24  flow-id     u64
//! 32  sequence    u64   \
//! 40  seconds     u32    > trailer, rewritten on every send
//! 44  nanoseconds u32   /
//! ```

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const TEST_HEADER_MAGIC: u64 = 0x5274_4272_6963_6b21;
pub const TEST_HEADER_LEN: usize = 48;
pub const TRAILER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Unicast = 1,
    Multicast = 2,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamKind::Unicast => "unicast",
            StreamKind::Multicast => "multicast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubType {
    #[default]
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv6pd = 3,
}

impl SubType {
    /// Frame length at which the test header needs no padding
    pub const fn min_length(self) -> u16 {
        match self {
            SubType::Ipv4 => 76,
            SubType::Ipv6 | SubType::Ipv6pd => 96,
        }
    }

    pub const fn is_ipv6(self) -> bool {
        !matches!(self, SubType::Ipv4)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SubType::Ipv4 => "ipv4",
            SubType::Ipv6 => "ipv6",
            SubType::Ipv6pd => "ipv6pd",
        }
    }

    /// Zero padding in front of the test header for a configured length
    pub fn padding(self, length: u16) -> usize {
        usize::from(length.saturating_sub(self.min_length()))
    }
}

impl std::fmt::Display for SubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up = 1,
    Down = 2,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "upstream",
            Direction::Down => "downstream",
        }
    }

    pub const fn reverse(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock send/receive time as carried in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0 };

    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: since.as_secs() as u32,
            nsec: since.subsec_nanos(),
        }
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: (nanos / 1_000_000_000) as u32,
            nsec: (nanos % 1_000_000_000) as u32,
        }
    }

    pub const fn as_nanos(self) -> u64 {
        self.sec as u64 * 1_000_000_000 + self.nsec as u64
    }

    pub const fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// `self - earlier` in nanoseconds, zero when `earlier` is later
    pub const fn nanos_since(self, earlier: Timestamp) -> u64 {
        self.as_nanos().saturating_sub(earlier.as_nanos())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderScope {
    Unicast {
        ifindex: u32,
        outer_vlan: u16,
        inner_vlan: u16,
    },
    Multicast {
        source: Ipv4Addr,
        group: Ipv4Addr,
    },
}

impl HeaderScope {
    pub const fn kind(&self) -> StreamKind {
        match self {
            HeaderScope::Unicast { .. } => StreamKind::Unicast,
            HeaderScope::Multicast { .. } => StreamKind::Multicast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestHeader {
    pub sub_type: SubType,
    pub direction: Direction,
    pub tos: u8,
    pub session_id: u32,
    pub scope: HeaderScope,
    pub flow_id: u64,
    pub seq: u64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TestHeaderError {
    #[error("test header needs 48 bytes, got {0}")]
    Truncated(usize),
    #[error("bad test header magic {0:#018x}")]
    BadMagic(u64),
    #[error("unknown test header {field} value {value}")]
    UnknownValue { field: &'static str, value: u8 },
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl TestHeader {
    pub fn kind(&self) -> StreamKind {
        self.scope.kind()
    }

    /// Write the 48 header bytes into `out[..48]`.
    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..TEST_HEADER_LEN];
        out[0..8].copy_from_slice(&TEST_HEADER_MAGIC.to_le_bytes());
        out[8] = self.kind() as u8;
        out[9] = self.sub_type as u8;
        out[10] = self.direction as u8;
        out[11] = self.tos;
        out[12..16].copy_from_slice(&self.session_id.to_le_bytes());
        match self.scope {
            HeaderScope::Unicast {
                ifindex,
                outer_vlan,
                inner_vlan,
            } => {
                out[16..20].copy_from_slice(&ifindex.to_le_bytes());
                out[20..22].copy_from_slice(&outer_vlan.to_le_bytes());
                out[22..24].copy_from_slice(&inner_vlan.to_le_bytes());
            }
            HeaderScope::Multicast { source, group } => {
                out[16..20].copy_from_slice(&source.octets());
                out[20..24].copy_from_slice(&group.octets());
            }
        }
        out[24..32].copy_from_slice(&self.flow_id.to_le_bytes());
        write_trailer(&mut out[32..], self.seq, self.timestamp);
    }

    /// Decode from exactly the last 48 bytes of a transport payload.
    pub fn decode(buf: &[u8]) -> Result<Self, TestHeaderError> {
        if buf.len() < TEST_HEADER_LEN {
            return Err(TestHeaderError::Truncated(buf.len()));
        }
        let magic = u64_at(buf, 0);
        if magic != TEST_HEADER_MAGIC {
            return Err(TestHeaderError::BadMagic(magic));
        }
        let sub_type = match buf[9] {
            1 => SubType::Ipv4,
            2 => SubType::Ipv6,
            3 => SubType::Ipv6pd,
            value => return Err(TestHeaderError::UnknownValue { field: "sub-type", value }),
        };
        let direction = match buf[10] {
            1 => Direction::Up,
            2 => Direction::Down,
            value => return Err(TestHeaderError::UnknownValue { field: "direction", value }),
        };
        let scope = match buf[8] {
            1 => HeaderScope::Unicast {
                ifindex: u32_at(buf, 16),
                outer_vlan: u16_at(buf, 20),
                inner_vlan: u16_at(buf, 22),
            },
            2 => HeaderScope::Multicast {
                source: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
                group: Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]),
            },
            value => return Err(TestHeaderError::UnknownValue { field: "type", value }),
        };
        Ok(Self {
            sub_type,
            direction,
            tos: buf[11],
            session_id: u32_at(buf, 12),
            scope,
            flow_id: u64_at(buf, 24),
            seq: u64_at(buf, 32),
            timestamp: Timestamp {
                sec: u32_at(buf, 40),
                nsec: u32_at(buf, 44),
            },
        })
    }

    /// Find the header at the tail of `payload`, if one is there.
    pub fn find(payload: &[u8]) -> Option<Self> {
        let start = payload.len().checked_sub(TEST_HEADER_LEN)?;
        Self::decode(&payload[start..]).ok()
    }
}

/// Write sequence and timestamp into a 16-byte trailer slot.
#[inline]
pub fn write_trailer(out: &mut [u8], seq: u64, timestamp: Timestamp) {
    out[0..8].copy_from_slice(&seq.to_le_bytes());
    out[8..12].copy_from_slice(&timestamp.sec.to_le_bytes());
    out[12..16].copy_from_slice(&timestamp.nsec.to_le_bytes());
}

/// Read sequence and timestamp back from the last 16 bytes of a frame.
pub fn read_trailer(frame: &[u8]) -> Option<(u64, Timestamp)> {
    let start = frame.len().checked_sub(TRAILER_LEN)?;
    let t = &frame[start..];
    Some((
        u64_at(t, 0),
        Timestamp {
            sec: u32_at(t, 8),
            nsec: u32_at(t, 12),
        },
    ))
}

/// IPv4 multicast group to Ethernet MAC (01:00:5e + low 23 bits).
pub fn multicast_mac(group: Ipv4Addr) -> [u8; 6] {
    let o = group.octets();
    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast_header() -> TestHeader {
        TestHeader {
            sub_type: SubType::Ipv6pd,
            direction: Direction::Up,
            tos: 0xb8,
            session_id: 17,
            scope: HeaderScope::Unicast {
                ifindex: 3,
                outer_vlan: 1000,
                inner_vlan: 7,
            },
            flow_id: 42,
            seq: 9,
            timestamp: Timestamp { sec: 100, nsec: 5 },
        }
    }

    #[test]
    fn test_layout_offsets() {
        let mut buf = [0u8; TEST_HEADER_LEN];
        unicast_header().encode(&mut buf);
        assert_eq!(&buf[0..8], &TEST_HEADER_MAGIC.to_le_bytes());
        assert_eq!(buf[8], 1);
        assert_eq!(buf[9], 3);
        assert_eq!(buf[10], 1);
        assert_eq!(buf[11], 0xb8);
        assert_eq!(u16_at(&buf, 20), 1000);
        assert_eq!(u64_at(&buf, 24), 42);
        assert_eq!(u64_at(&buf, 32), 9);
        assert_eq!(u32_at(&buf, 40), 100);
    }

    #[test]
    fn test_decode_multicast_scope() {
        let mut header = unicast_header();
        header.sub_type = SubType::Ipv4;
        header.direction = Direction::Down;
        header.scope = HeaderScope::Multicast {
            source: Ipv4Addr::new(10, 0, 0, 1),
            group: Ipv4Addr::new(239, 1, 1, 1),
        };
        let mut buf = [0u8; TEST_HEADER_LEN];
        header.encode(&mut buf);
        assert_eq!(TestHeader::decode(&buf), Ok(header));
    }

    #[test]
    fn test_find_requires_magic() {
        let mut payload = vec![0u8; 80];
        assert!(TestHeader::find(&payload).is_none());
        unicast_header().encode(&mut payload[32..]);
        assert_eq!(TestHeader::find(&payload).map(|h| h.flow_id), Some(42));
        assert!(TestHeader::find(&payload[..40]).is_none());
    }

    #[test]
    fn test_unknown_direction_rejected() {
        let mut buf = [0u8; TEST_HEADER_LEN];
        unicast_header().encode(&mut buf);
        buf[10] = 9;
        assert!(matches!(
            TestHeader::decode(&buf),
            Err(TestHeaderError::UnknownValue { field: "direction", .. })
        ));
    }

    #[test]
    fn test_trailer_rewrite() {
        let mut frame = vec![0u8; 64];
        write_trailer(&mut frame[48..], 77, Timestamp { sec: 1, nsec: 2 });
        assert_eq!(read_trailer(&frame), Some((77, Timestamp { sec: 1, nsec: 2 })));
    }

    #[test]
    fn test_multicast_mac_mapping() {
        assert_eq!(
            multicast_mac(Ipv4Addr::new(239, 1, 1, 1)),
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]
        );
        // The 24th bit is dropped.
        assert_eq!(
            multicast_mac(Ipv4Addr::new(224, 129, 2, 3)),
            multicast_mac(Ipv4Addr::new(224, 1, 2, 3))
        );
    }

    #[test]
    fn test_padding_floor() {
        assert_eq!(SubType::Ipv4.padding(128), 52);
        assert_eq!(SubType::Ipv6.padding(128), 32);
        assert_eq!(SubType::Ipv4.padding(60), 0);
    }

    #[test]
    fn test_timestamp_nanos() {
        let ts = Timestamp::from_nanos(3_500_000_000);
        assert_eq!(ts, Timestamp { sec: 3, nsec: 500_000_000 });
        assert_eq!(ts.nanos_since(Timestamp::from_nanos(1_000_000_000)), 2_500_000_000);
        assert_eq!(Timestamp::ZERO.nanos_since(ts), 0);
    }
}
