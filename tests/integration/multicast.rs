// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{at_ms, config, parse, Harness};
use std::net::{IpAddr, Ipv4Addr};
use traffic_streams::egress::CaptureEgress;
use traffic_streams::packet::StreamKind;

const MULTICAST: &str = r#"
    "multicast-traffic": {
        group: "239.1.1.1",
        "group-count": 3,
        pps: 10,
    },
"#;

#[test]
fn test_groups_use_derived_mac_and_scope() {
    let mut h = Harness::new(config(MULTICAST));
    assert_eq!(h.engine.registry().len(), 3);
    assert_eq!(h.engine.flows().total_flows, 0);

    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive(&mut egress, 0..=99), 3);

    let mut groups = Vec::new();
    for frame in egress.on("net0") {
        let (parsed, header) = parse(frame);
        assert_eq!(header.kind(), StreamKind::Multicast);
        let IpAddr::V4(group) = parsed.network.dst else {
            panic!("ipv4 group expected");
        };
        let o = group.octets();
        assert_eq!(parsed.dst_mac, [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]);
        assert_eq!(parsed.network.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        groups.push(group);
    }
    groups.sort();
    assert_eq!(
        groups,
        vec![
            Ipv4Addr::new(239, 1, 1, 1),
            Ipv4Addr::new(239, 1, 1, 2),
            Ipv4Addr::new(239, 1, 1, 3)
        ]
    );
}

#[test]
fn test_multicast_is_not_correlated() {
    let mut h = Harness::new(config(MULTICAST));
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=99);
    for frame in egress.on("net0") {
        assert_eq!(h.engine.rx_frame("acc0", frame, at_ms(100)), None);
    }
    assert!(h.engine.registry().all().iter().all(|s| !s.is_verified()));
}

#[test]
fn test_multicast_gate_follows_autostart() {
    let mut h = Harness::new(config(
        r#""multicast-traffic": { group: "239.1.1.1", pps: 10, autostart: false },"#,
    ));
    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive(&mut egress, 0..=300), 0);

    h.engine.start_multicast();
    assert!(h.drive(&mut egress, 301..=600) > 0);

    h.engine.stop_multicast();
    egress.clear();
    assert_eq!(h.drive(&mut egress, 601..=900), 0);
}
