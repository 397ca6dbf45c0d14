// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{at_ms, config, parse, sequences, Harness};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use traffic_streams::directory::StaticDirectory;
use traffic_streams::egress::CaptureEgress;
use traffic_streams::logging::{Logger, MPSCRingBuffer};
use traffic_streams::packet::Direction;
use traffic_streams::stream::verify::RejectReason;
use traffic_streams::stream::{MacCheck, RxPacket, RxVerdict};
use traffic_streams::{SetupError, StreamEngine};

const PEERS: &[(&str, &str)] = &[("acc0", "net0"), ("net0", "acc0")];

const RAW_AND_SESSION: &str = r#"
    streams: [
        { name: "R1", type: "ipv4", pps: 10, "ipv4-destination-address": "10.1.0.1" },
        { name: "BE", "stream-group-id": 1, type: "ipv4", direction: "both", pps: 10 },
    ],
"#;

#[test]
fn test_flow_ids_index_the_registry() {
    let h = Harness::new(config(RAW_AND_SESSION));
    let registry = h.engine.registry();
    assert_eq!(registry.len(), 3);
    for flow_id in 1..=3 {
        assert_eq!(registry.get(flow_id).map(|s| s.flow_id), Some(flow_id));
    }
    assert!(registry.get(0).is_none());
    assert!(registry.get(4).is_none());
    assert_eq!(h.engine.flows().total_flows, 3);

    // Attaching a session twice adds nothing.
    assert_eq!(h.engine.add_session(1).unwrap(), 0);
    assert_eq!(registry.len(), 3);
}

#[test]
fn test_failed_session_leaves_no_streams() {
    // net0 has no IPv6 address, so the V6 upstream template cannot resolve.
    let config = config(
        r#"streams: [
            { name: "BE", "stream-group-id": 1, type: "ipv4", direction: "both", pps: 10 },
            { name: "V6", "stream-group-id": 1, type: "ipv6", direction: "upstream", pps: 10 },
        ],
        "session-traffic": { "ipv4-pps": 10 },"#,
    );
    let directory = Arc::new(StaticDirectory::from_config(&config.topology).unwrap());
    let logger = Logger::from_ring(Arc::new(MPSCRingBuffer::new(64)));
    let engine = StreamEngine::setup(config, directory.collaborators(), logger).unwrap();

    for _ in 0..2 {
        assert!(matches!(
            engine.add_session(1),
            Err(SetupError::MissingDestination { .. })
        ));
        assert!(engine.registry().is_empty());
        assert!(!engine.registry().has_session(1));
    }
    assert_eq!(engine.flows().total_flows, 0);
    assert_eq!(engine.flows().session_traffic_flows, 0);
    assert!(engine.take_channels().iter().all(|c| c.handle().pending() == 0));
}

#[test]
fn test_bidirectional_streams_are_paired() {
    let h = Harness::new(config(RAW_AND_SESSION));
    let registry = h.engine.registry();

    let raw = registry.get(1).unwrap();
    assert_eq!(raw.reverse(), None);
    assert_eq!(raw.session_id, None);

    let up = registry.get(2).unwrap();
    let down = registry.get(3).unwrap();
    assert_eq!(up.direction, Direction::Up);
    assert_eq!(down.direction, Direction::Down);
    assert_eq!(up.tx_interface, "acc0");
    assert_eq!(down.tx_interface, "net0");
    assert_eq!(up.reverse(), Some(down.flow_id));
    assert_eq!(
        up.reverse().and_then(|id| registry.get(id)).and_then(|s| s.reverse()),
        Some(up.flow_id)
    );
    assert_eq!(registry.session_streams(1).len(), 2);
}

#[test]
fn test_loopback_verifies_every_flow() {
    let mut h = Harness::new(config(&format!(
        r#"{RAW_AND_SESSION} "session-traffic": {{ "ipv4-pps": 1 }},"#
    )));
    let totals = h.engine.flows();
    assert_eq!(totals.total_flows, 3);
    assert_eq!(totals.session_traffic_flows, 2);

    h.drive_loopback(0..=300, PEERS);

    let totals = h.engine.flows();
    assert_eq!(totals.verified_flows, 3);
    assert_eq!(totals.session_traffic_flows_verified, 2);
    assert!(h.engine.registry().all().iter().all(|s| s.is_verified()));
    assert!(h.logged("ALL STREAM TRAFFIC FLOWS VERIFIED"));
    assert!(h.logged("ALL SESSION TRAFFIC FLOWS VERIFIED"));

    h.engine.rollup();
    let session = h.engine.stats().session(1).unwrap();
    assert_eq!(session.session_traffic_flows, 2);
    assert_eq!(session.session_traffic_flows_verified, 2);
    assert!(session.packets_rx > 0);
}

#[test]
fn test_in_order_delivery_has_no_loss() {
    let mut h = Harness::new(config(RAW_AND_SESSION));
    h.drive_loopback(0..=1000, PEERS);
    for stream in h.engine.registry().all() {
        assert!(stream.tx_packets() >= 9, "{stream:?}");
        assert_eq!(stream.rx_packets(), stream.tx_packets());
        assert_eq!(stream.rx_loss(), 0);
        assert_eq!(stream.counters.rx_wrong_order.load(Ordering::Relaxed), 0);
    }
}

#[test]
fn test_stop_verified_disables_session_pairs_only() {
    let mut h = Harness::new(config(&format!(
        r#"traffic: {{ "stop-verified": true }}, {RAW_AND_SESSION}"#
    )));
    h.drive_loopback(0..=300, PEERS);

    let registry = h.engine.registry();
    let raw = registry.get(1).unwrap();
    assert!(raw.is_verified());
    assert!(raw.is_enabled());
    for flow_id in [2, 3] {
        let stream = registry.get(flow_id).unwrap();
        assert!(stream.is_verified());
        assert!(!stream.is_enabled());
    }
}

#[test]
fn test_reset_restarts_sequence_and_verification() {
    let mut h = Harness::new(config(RAW_AND_SESSION));
    h.drive_loopback(0..=150, PEERS);
    assert_eq!(h.engine.flows().verified_flows, 3);

    assert_eq!(h.engine.reset_all(), 3);
    assert_eq!(h.engine.flows().verified_flows, 0);
    let raw = h.engine.registry().get(1).unwrap();
    assert!(!raw.is_verified());
    assert_eq!(raw.tx_packets(), 0);
    assert_eq!(raw.rx_packets(), 0);
    assert_eq!(raw.rx_state().last_seq, 0);

    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 151..=500);
    let seqs = sequences(egress.on("net0").filter(|f| parse(f).1.flow_id == 1));
    assert!(!seqs.is_empty());
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());

    h.drive_loopback(501..=800, PEERS);
    assert!(raw.is_verified());
    assert_eq!(h.engine.flows().verified_flows, 3);
}

#[test]
fn test_reset_skips_session_traffic() {
    let mut h = Harness::new(config(r#""session-traffic": { "ipv4-pps": 10 },"#));
    h.drive_loopback(0..=150, PEERS);
    assert_eq!(h.engine.flows().session_traffic_flows_verified, 2);

    assert_eq!(h.engine.reset_all(), 0);
    assert!(h.engine.registry().all().iter().all(|s| s.is_verified()));
}

#[test]
fn test_session_traffic_detects_wrong_session() {
    let mut h = Harness::new(config(r#""session-traffic": { "ipv4-pps": 10 },"#));
    let down = h
        .engine
        .registry()
        .session_streams(1)
        .into_iter()
        .find(|s| s.session_traffic && s.direction == Direction::Down)
        .unwrap();

    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=50);
    let frame = egress
        .on("net0")
        .find(|f| parse(f).1.flow_id == down.flow_id)
        .unwrap()
        .to_vec();

    // Routed frames carry the gateway MAC, which is not the client's.
    assert_eq!(
        h.engine.rx_frame("acc0", &frame, at_ms(60)),
        Some(RxVerdict::Rejected(RejectReason::MacMismatch))
    );

    let (mut parsed, header) = parse(&frame);
    parsed.dst_mac = [0x02, 0, 0, 0, 0x01, 0x01];
    let mut foreign = header;
    foreign.session_id = 2;
    let packet = RxPacket {
        frame: &parsed,
        header: &foreign,
        interface: "acc0",
        timestamp: at_ms(60),
    };
    assert_eq!(h.engine.rx(&packet, MacCheck::Session), Some(RxVerdict::WrongSession));
    assert_eq!(down.counters.rx_wrong_session.load(Ordering::Relaxed), 1);
    assert_eq!(down.rx_packets(), 0);
    assert!(!down.is_verified());

    let packet = RxPacket {
        header: &header,
        ..packet
    };
    assert_eq!(
        h.engine.rx(&packet, MacCheck::Session),
        Some(RxVerdict::Accepted {
            first: true,
            newly_verified: true
        })
    );
    assert_eq!(h.engine.flows().session_traffic_flows_verified, 1);
}

#[test]
fn test_session_down_rejects_first_packet() {
    let mut h = Harness::new(config(RAW_AND_SESSION));
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=50);
    let frame = egress
        .on("net0")
        .find(|f| parse(f).1.flow_id == 3)
        .unwrap()
        .to_vec();
    let (mut parsed, header) = parse(&frame);
    parsed.dst_mac = [0x02, 0, 0, 0, 0x01, 0x01];

    h.directory
        .set_session_state(1, traffic_streams::collaborators::SessionState::Terminated);
    let packet = RxPacket {
        frame: &parsed,
        header: &header,
        interface: "acc0",
        timestamp: at_ms(60),
    };
    assert_eq!(
        h.engine.rx(&packet, MacCheck::Session),
        Some(RxVerdict::Rejected(RejectReason::SessionDown))
    );
}

#[test]
fn test_unknown_flow_is_unmatched() {
    let mut h = Harness::new(config(RAW_AND_SESSION));
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=50);
    let frame = egress.on("net0").next().unwrap().to_vec();
    let (parsed, mut header) = parse(&frame);
    header.flow_id = 99;
    let packet = RxPacket {
        frame: &parsed,
        header: &header,
        interface: "acc0",
        timestamp: at_ms(60),
    };
    assert_eq!(h.engine.rx(&packet, MacCheck::Skip), None);
}
