// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{at_ms, config, parse, sequences, Harness};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use traffic_streams::egress::CaptureEgress;
use traffic_streams::packet::header::read_trailer;

const RAW_10PPS: &str = r#"
    streams: [
        {
            name: "R1",
            type: "ipv4",
            pps: 10,
            length: 100,
            "ipv4-destination-address": "10.1.0.1",
        },
    ],
"#;

#[test]
fn test_ten_pps_sends_five_frames_in_half_a_second() {
    let mut h = Harness::new(config(RAW_10PPS));
    let mut egress = CaptureEgress::new();

    assert_eq!(h.drive(&mut egress, 0..=500), 5);
    assert_eq!(egress.on("acc0").count(), 0);
    assert_eq!(sequences(egress.on("net0")), vec![1, 2, 3, 4, 5]);

    let sent_at: Vec<_> = egress
        .on("net0")
        .filter_map(read_trailer)
        .map(|(_, ts)| ts)
        .collect();
    let expected: Vec<_> = [1, 101, 201, 301, 401].into_iter().map(at_ms).collect();
    assert_eq!(sent_at, expected);

    let stream = h.engine.registry().get(1).unwrap();
    assert_eq!(stream.tx_packets(), 5);
    assert_eq!(h.channel("net0").handle().packets_sent.load(Ordering::Relaxed), 5);
}

#[test]
fn test_frames_carry_flow_and_configured_length() {
    let mut h = Harness::new(config(RAW_10PPS));
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=50);

    let frame = egress.on("net0").next().expect("one frame");
    let (parsed, header) = parse(frame);
    assert_eq!(header.flow_id, 1);
    assert_eq!(header.seq, 1);
    assert_eq!(parsed.network.dst, "10.1.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(parsed.network.src, "10.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(parsed.dst_mac, [0x02, 0, 0, 0, 0, 0x21]);
    assert_eq!(parsed.transport.dst_port, 65056);
    assert_eq!(parsed.network.ttl, 64);
}

#[test]
fn test_traffic_gate_pauses_raw_streams() {
    let mut h = Harness::new(config(RAW_10PPS));
    let mut egress = CaptureEgress::new();

    h.engine.stop_traffic();
    assert!(!h.engine.traffic_active());
    assert_eq!(h.drive(&mut egress, 0..=300), 0);

    h.engine.start_traffic();
    assert!(h.drive(&mut egress, 301..=600) > 0);
    // Sequence numbering starts where nothing was sent before.
    assert_eq!(sequences(egress.on("net0")).first(), Some(&1));
}

#[test]
fn test_autostart_off_keeps_streams_passive() {
    let mut h = Harness::new(config(&format!("traffic: {{ autostart: false }}, {RAW_10PPS}")));
    let mut egress = CaptureEgress::new();
    assert!(!h.engine.traffic_active());
    assert_eq!(h.drive(&mut egress, 0..=300), 0);
}

#[test]
fn test_max_packets_caps_the_flow() {
    let mut h = Harness::new(config(
        r#"streams: [
            {
                name: "R1",
                type: "ipv4",
                pps: 100,
                "max-packets": 3,
                "ipv4-destination-address": "10.1.0.1",
            },
        ],"#,
    ));
    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive(&mut egress, 0..=1000), 3);
    assert_eq!(sequences(egress.on("net0")), vec![1, 2, 3]);
}

#[test]
fn test_send_failure_is_retried_without_losing_sequence() {
    let mut h = Harness::new(config(RAW_10PPS));
    let mut egress = CaptureEgress::new();
    egress.set_down("net0", true);
    assert_eq!(h.drive(&mut egress, 0..=10), 0);
    assert!(h.channel("net0").handle().send_errors.load(Ordering::Relaxed) > 0);

    egress.set_down("net0", false);
    h.drive(&mut egress, 11..=250);
    let seqs = sequences(egress.on("net0"));
    assert_eq!(seqs.first(), Some(&1));
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_equal_rates_share_a_bucket_with_spread_offsets() {
    let mut h = Harness::new(config(
        r#"streams: [
            { name: "A", type: "ipv4", pps: 10, "ipv4-destination-address": "10.1.0.1" },
            { name: "B", type: "ipv4", pps: 10, "ipv4-destination-address": "10.1.0.2" },
        ],"#,
    ));
    let mut egress = CaptureEgress::new();
    // A is due at the round start, B half an interval later.
    assert_eq!(h.drive(&mut egress, 0..=40), 1);
    assert_eq!(h.drive(&mut egress, 41..=60), 1);
    assert_eq!(h.channel("net0").stream_count(), 2);
}

#[test]
fn test_clock_starting_at_zero_paces_the_same() {
    let mut h = Harness::new(config(RAW_10PPS));
    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive_from(0, &mut egress, 0..=500), 5);
    assert_eq!(sequences(egress.on("net0")), vec![1, 2, 3, 4, 5]);
}

const DELAYED: &str = r#"
    streams: [
        {
            name: "R1",
            type: "ipv4",
            pps: 10,
            "start-delay": 1,
            "ipv4-destination-address": "10.1.0.1",
        },
    ],
"#;

#[test]
fn test_start_delay_holds_first_send() {
    let mut h = Harness::new(config(DELAYED));
    let mut egress = CaptureEgress::new();

    // The wait starts at the first due cycle (second 0) and must exceed one
    // full second, so nothing leaves before second 2.
    assert_eq!(h.drive(&mut egress, 0..=1999), 0);
    assert_eq!(h.drive(&mut egress, 2000..=2500), 5);
    let first = egress.on("net0").next().and_then(read_trailer);
    assert_eq!(first, Some((1, at_ms(2001))));
}

#[test]
fn test_reset_rearms_start_delay() {
    let mut h = Harness::new(config(DELAYED));
    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive(&mut egress, 0..=3000), 10);

    assert_eq!(h.engine.reset_all(), 1);
    egress.clear();
    assert_eq!(h.drive(&mut egress, 3001..=3500), 0);
    assert_eq!(h.drive(&mut egress, 3501..=4999), 0);
    assert_eq!(h.drive(&mut egress, 5000..=5500), 5);
    assert_eq!(sequences(egress.on("net0")), vec![1, 2, 3, 4, 5]);
    assert_eq!(h.engine.registry().get(1).unwrap().tx_packets(), 5);
}

const SETUP_INTERVAL: &str = r#"
    streams: [
        {
            name: "R1",
            type: "ipv4",
            pps: 10,
            "setup-interval": 1,
            "ipv4-destination-address": "10.1.0.1",
        },
    ],
"#;

#[test]
fn test_setup_interval_staggers_unverified_flow() {
    let mut h = Harness::new(config(SETUP_INTERVAL));
    let mut egress = CaptureEgress::new();
    let stream = h.engine.registry().get(1).unwrap();
    assert!(stream.in_setup());

    // One frame per interval while nothing comes back.
    assert_eq!(h.drive(&mut egress, 0..=3000), 2);
    let sent_at: Vec<_> = egress
        .on("net0")
        .filter_map(read_trailer)
        .map(|(_, ts)| ts)
        .collect();
    assert_eq!(sent_at, vec![at_ms(1), at_ms(2001)]);
    assert!(stream.in_setup());
    assert!(!stream.is_verified());
}

#[test]
fn test_verification_ends_setup_interval() {
    let mut h = Harness::new(config(SETUP_INTERVAL));
    let stream = h.engine.registry().get(1).unwrap();

    // An unknown receive interface skips the MAC check.
    assert_eq!(h.drive_loopback(0..=500, &[("net0", "mirror0")]), 5);
    assert!(stream.is_verified());
    assert!(!stream.in_setup());
    assert_eq!(stream.rx_packets(), 5);
}
