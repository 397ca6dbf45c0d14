// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{config, Harness};
use std::time::Duration;
use traffic_streams::collaborators::SessionDirectory;
use traffic_streams::egress::CaptureEgress;
use traffic_streams::SetupError;

const RAW: &str = r#"
    streams: [
        { name: "R1", type: "ipv4", pps: 10, length: 100, "ipv4-destination-address": "10.1.0.1" },
    ],
"#;

// Wall-clock sleep; instrumented runs are too slow for the one second tick.
#[cfg_attr(tarpaulin, ignore)]
#[tokio::test]
async fn test_group_timer_rolls_up_interface_counters() {
    let mut h = Harness::new(config(RAW));
    let mut egress = CaptureEgress::new();
    assert_eq!(h.drive(&mut egress, 0..=500), 5);
    assert!(h.engine.stats().interface("net0").is_none());

    h.engine.spawn_group_timers();
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let stats = h.engine.stats().interface("net0").expect("rolled up");
    assert_eq!(stats.packets_tx, 5);
    assert_eq!(stats.stream_tx, 5);
    let tx_len = h.engine.registry().get(1).unwrap().tx_len();
    assert!(tx_len > 0);
    assert_eq!(stats.bytes_tx, 5 * tx_len);
    h.engine.stop_group_timers();
}

#[tokio::test]
async fn test_teardown_stops_traffic_and_logs_totals() {
    let mut h = Harness::new(config(RAW));
    h.engine.spawn_group_timers();
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=200);

    h.engine.teardown();
    assert!(!h.engine.traffic_active());
    assert_eq!(h.engine.stats().interface("net0").unwrap().packets_tx, 2);
    assert_eq!(h.drive(&mut egress, 201..=600), 0);
    assert!(h.logged("stream engine stopped"));
}

#[test]
fn test_teardown_stops_stream_creation() {
    let h = Harness::new(config(
        r#"streams: [
            { name: "BE", "stream-group-id": 1, type: "ipv4", direction: "both", pps: 10 },
        ],"#,
    ));
    assert_eq!(h.engine.registry().len(), 2);
    let mut view = h.directory.session(1).expect("session 1");
    view.session_id = 2;
    h.directory.add_session(view);

    h.engine.teardown();
    assert!(matches!(h.engine.add_session(2), Err(SetupError::ShuttingDown)));
    assert_eq!(h.engine.registry().len(), 2);
    assert!(h.engine.registry().session_streams(2).is_empty());
}
