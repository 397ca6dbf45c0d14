// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{at_ms, config, parse, Harness};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use traffic_streams::control::stream_info;
use traffic_streams::egress::CaptureEgress;
use traffic_streams::packet::Direction;
use traffic_streams::stream::{MacCheck, RxPacket, RxVerdict};

const NAT_PAIR: &str = r#"
    streams: [
        {
            name: "NAT",
            "stream-group-id": 1,
            type: "ipv4",
            direction: "both",
            pps: 10,
            nat: true,
            "source-port": 5000,
            "destination-port": 6000,
        },
    ],
"#;

#[test]
fn test_downstream_waits_for_translated_source() {
    let mut h = Harness::new(config(NAT_PAIR));
    let up = h.engine.registry().get(1).unwrap();
    let down = h.engine.registry().get(2).unwrap();
    assert!(up.nat && down.nat);
    assert_eq!(down.direction, Direction::Down);

    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=150);
    assert_eq!(egress.on("acc0").count(), 2);
    assert_eq!(egress.on("net0").count(), 0);
    assert_eq!(down.tx_packets(), 0);

    // The upstream frame arrives with source address and port rewritten.
    let frame = egress.on("acc0").next().unwrap().to_vec();
    let (mut parsed, header) = parse(&frame);
    assert_eq!(parsed.transport.src_port, 5000);
    assert_eq!(parsed.transport.dst_port, 6000);
    parsed.network.src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    parsed.transport.src_port = 40000;
    let verdict = h.engine.rx(
        &RxPacket {
            frame: &parsed,
            header: &header,
            interface: "net0",
            timestamp: at_ms(151),
        },
        MacCheck::Skip,
    );
    assert_eq!(
        verdict,
        Some(RxVerdict::Accepted {
            first: true,
            newly_verified: true
        })
    );
    let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 40000);
    assert_eq!(up.nat_source(), Some(target));

    egress.clear();
    h.drive(&mut egress, 152..=400);
    let frame = egress.on("net0").next().expect("downstream released").to_vec();
    let (parsed, header) = parse(&frame);
    assert_eq!(header.flow_id, down.flow_id);
    assert_eq!(parsed.network.dst, IpAddr::V4(*target.ip()));
    assert_eq!(parsed.transport.dst_port, 40000);
    // Downstream ports mirror the upstream flow.
    assert_eq!(parsed.transport.src_port, 6000);

    let info = stream_info(&h.engine, &down, false);
    assert_eq!(info.destination_address, Some(IpAddr::V4(*target.ip())));
    assert_eq!(info.destination_port, 40000);
    let info = stream_info(&h.engine, &up, false);
    let rx = info.rx.unwrap();
    assert_eq!(rx.rx_source_ip, Some(*target.ip()));
    assert_eq!(rx.rx_source_port, Some(40000));
}

#[test]
fn test_reset_forgets_translated_source() {
    let mut h = Harness::new(config(NAT_PAIR));
    h.drive_loopback(0..=150, &[("acc0", "net0"), ("net0", "acc0")]);
    let up = h.engine.registry().get(1).unwrap();
    // Looped back untranslated, the observed source is the session address.
    assert_eq!(
        up.nat_source(),
        Some(SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 2), 5000))
    );
    h.engine.reset_all();
    assert_eq!(up.nat_source(), None);
}
