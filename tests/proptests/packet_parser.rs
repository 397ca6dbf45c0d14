// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Property-Based Tests: Frame Parser
//!
//! The receive path hands every frame seen on an interface to `parse_frame`,
//! so the parser must cope with anything the wire delivers.
//!
//! # Coverage
//!
//! - **Arbitrary Byte Arrays:** the parser returns `Ok` or `Err` for any input
//!   and never panics.
//! - **Truncated Test Frames:** a valid test frame cut at any length either
//!   fails to parse or yields no test header; it never yields a header with
//!   a different flow id.
//! - **Encapsulation Depth:** VLAN stacks and MPLS stacks of random depth in
//!   front of a test packet still surface the flow id.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::net::Ipv4Addr;
    use traffic_streams::packet::chain::ETH_TYPE_VLAN;
    use traffic_streams::packet::{
        parse_frame, Direction, Header, HeaderChain, HeaderScope, SubType, TestHeader, Timestamp,
    };

    fn test_header(flow_id: u64) -> Header {
        Header::Test {
            header: TestHeader {
                sub_type: SubType::Ipv4,
                direction: Direction::Up,
                tos: 0,
                session_id: 7,
                scope: HeaderScope::Unicast {
                    ifindex: 1,
                    outer_vlan: 0,
                    inner_vlan: 0,
                },
                flow_id,
                seq: 1,
                timestamp: Timestamp::ZERO,
            },
            padding: 16,
        }
    }

    fn frame(flow_id: u64, vlans: &[u16], labels: &[u32]) -> Vec<u8> {
        let mut chain = HeaderChain::new();
        chain.push(Header::Ethernet {
            dst: [2, 0, 0, 0, 0, 1],
            src: [2, 0, 0, 0, 0, 2],
        });
        for &id in vlans {
            chain.push(Header::Vlan {
                tpid: ETH_TYPE_VLAN,
                id,
                priority: 0,
            });
        }
        for &label in labels {
            chain.push(Header::Mpls {
                label,
                exp: 0,
                ttl: 255,
            });
        }
        chain
            .push(Header::Ipv4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 1, 0, 1),
                tos: 0,
                ttl: 64,
                dont_fragment: false,
            })
            .push(Header::Udp {
                src_port: 65056,
                dst_port: 65056,
            })
            .push(test_header(flow_id));
        chain.encode(256).unwrap().bytes
    }

    proptest! {
        /// **Property:** `parse_frame` never panics.
        ///
        /// **Strategy:** arbitrary byte vectors, including the empty one.
        #[test]
        fn test_parse_frame_does_not_panic(input in any::<Vec<u8>>()) {
            let _ = parse_frame(&input);
        }

        /// **Property:** arbitrary bytes behind a valid Ethernet/IPv4 prefix
        /// never panic either; this reaches the deeper decoders far more often
        /// than fully random input.
        #[test]
        fn test_parse_random_payload_does_not_panic(tail in prop::collection::vec(any::<u8>(), 0..200)) {
            let mut input = frame(1, &[], &[]);
            input.truncate(14 + 20);
            input.extend_from_slice(&tail);
            let _ = parse_frame(&input);
        }

        /// **Property:** a truncated test frame never reports a foreign flow.
        #[test]
        fn test_truncated_frame(flow_id in 1u64..u64::MAX, cut in 0usize..140) {
            let full = frame(flow_id, &[], &[]);
            let cut = cut.min(full.len());
            if let Ok(parsed) = parse_frame(&full[..cut]) {
                if let Some(header) = parsed.test_header {
                    prop_assert_eq!(header.flow_id, flow_id);
                }
            }
        }

        /// **Property:** the flow id survives any VLAN and MPLS stack depth
        /// the builders produce.
        #[test]
        fn test_encapsulation_depth(
            flow_id in 1u64..1_000_000,
            vlans in prop::collection::vec(1u16..4095, 0..3),
            labels in prop::collection::vec(16u32..1_048_575, 0..3),
        ) {
            let parsed = parse_frame(&frame(flow_id, &vlans, &labels)).unwrap();
            prop_assert_eq!(parsed.test_header.map(|h| h.flow_id), Some(flow_id));
            prop_assert_eq!(parsed.vlans.len(), vlans.len());
            prop_assert_eq!(parsed.mpls[0].map(|l| l.label), labels.first().copied());
        }
    }
}
