// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Property-Based Tests: Receive Sequence Accounting
//!
//! Loss and reordering are derived from the sequence numbers of one flow
//! alone. Whatever order packets arrive in, the counters must stay
//! consistent with each other:
//!
//! - every accepted packet is counted exactly once;
//! - a packet is either an advance or a late arrival, never both;
//! - the loss accumulated by advances equals the span they covered minus
//!   the packets that covered it, so late packets never reduce loss.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use traffic_streams::collaborators::{EndpointGate, GateState};
    use traffic_streams::config::{DirectionConfig, StreamConfig};
    use traffic_streams::directory::StaticDirectory;
    use traffic_streams::logging::{Logger, MPSCRingBuffer};
    use traffic_streams::packet::checksum::IPPROTO_UDP;
    use traffic_streams::packet::parser::{NetworkInfo, TransportInfo};
    use traffic_streams::packet::{
        Direction, HeaderScope, ParsedFrame, StreamKind, SubType, TestHeader, Timestamp, Topology,
    };
    use traffic_streams::stream::verify::{receive, RxContext};
    use traffic_streams::stream::{MacCheck, RxPacket, RxVerdict, Stream, StreamSpec};

    fn stream() -> Stream {
        let mut config = StreamConfig::new("P", SubType::Ipv4, DirectionConfig::Downstream, 10.0);
        config.ipv4_destination_address = Some(Ipv4Addr::new(10, 1, 0, 1));
        Stream::new(StreamSpec {
            flow_id: 1,
            config: Arc::new(config),
            kind: StreamKind::Unicast,
            direction: Direction::Down,
            topology: Topology::NetworkDown,
            session_id: None,
            tunnel_id: None,
            tx_interface: "net0".into(),
            endpoint: EndpointGate::shared(GateState::Active),
            enabled: true,
            ldp_lookup: false,
        })
    }

    fn frame() -> ParsedFrame {
        ParsedFrame {
            dst_mac: [2, 0, 0, 0, 0, 1],
            src_mac: [2, 0, 0, 0, 0, 2],
            vlans: Vec::new(),
            mpls: [None, None],
            pppoe_session_id: None,
            l2tp: None,
            network: NetworkInfo {
                src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dst: IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)),
                tos: 0,
                ttl: 64,
            },
            transport: TransportInfo {
                protocol: IPPROTO_UDP,
                src_port: 65056,
                dst_port: 65056,
            },
            frame_len: 128,
            test_header: None,
        }
    }

    fn deliver(stream: &Stream, seqs: &[u64]) -> Vec<RxVerdict> {
        let sessions = StaticDirectory::new();
        let logger = Logger::from_ring(Arc::new(MPSCRingBuffer::new(16)));
        let ctx = RxContext {
            sessions: &sessions,
            delay_calc: true,
            logger: &logger,
        };
        let frame = frame();
        seqs.iter()
            .map(|&seq| {
                let header = TestHeader {
                    sub_type: SubType::Ipv4,
                    direction: Direction::Down,
                    tos: 0,
                    session_id: 0,
                    scope: HeaderScope::Unicast {
                        ifindex: 0,
                        outer_vlan: 0,
                        inner_vlan: 0,
                    },
                    flow_id: 1,
                    seq,
                    timestamp: Timestamp { sec: 100, nsec: 0 },
                };
                let packet = RxPacket {
                    frame: &frame,
                    header: &header,
                    interface: "net0",
                    timestamp: Timestamp { sec: 100, nsec: 500_000 },
                };
                receive(stream, &packet, MacCheck::Skip, &ctx)
            })
            .collect()
    }

    proptest! {
        /// **Property:** counters stay consistent for any arrival order.
        ///
        /// **Strategy:** arbitrary sequences of sequence numbers, covering
        /// gaps, duplicates and reordering.
        #[test]
        fn test_counters_consistent(seqs in prop::collection::vec(1u64..1000, 1..100)) {
            let s = stream();
            let verdicts = deliver(&s, &seqs);
            let n = seqs.len() as u64;

            let newly: Vec<_> = verdicts
                .iter()
                .filter(|v| matches!(v, RxVerdict::Accepted { newly_verified: true, .. }))
                .collect();
            prop_assert_eq!(newly.len(), 1);
            prop_assert!(s.is_verified());

            let wrong_order = s.counters.rx_wrong_order.load(Ordering::Relaxed);
            let loss = s.rx_loss();
            let rx = s.rx_state();
            prop_assert_eq!(s.rx_packets(), n);
            prop_assert_eq!(rx.first_seq, seqs[0]);
            prop_assert_eq!(rx.last_seq, *seqs.iter().max().unwrap());

            let advances = n - 1 - wrong_order;
            prop_assert_eq!(loss + advances, rx.last_seq - rx.first_seq);
        }

        /// **Property:** an in-order flow with gaps loses exactly the gaps.
        #[test]
        fn test_gaps_are_loss(seqs in prop::collection::btree_set(1u64..10_000, 1..200)) {
            let seqs: Vec<u64> = seqs.into_iter().collect();
            let s = stream();
            deliver(&s, &seqs);
            let span = seqs[seqs.len() - 1] - seqs[0] + 1;
            prop_assert_eq!(s.rx_loss(), span - seqs.len() as u64);
            prop_assert_eq!(s.counters.rx_wrong_order.load(Ordering::Relaxed), 0);
        }
    }
}
