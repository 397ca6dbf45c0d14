// SPDX-License-Identifier: Apache-2.0 OR MIT
use crate::common::{at_ms, config, parse, Harness};
use serde_json::{json, Value};
use traffic_streams::control::handle_json;
use traffic_streams::egress::CaptureEgress;
use traffic_streams::stream::MacCheck;
use traffic_streams::stream::RxPacket;

const PEERS: &[(&str, &str)] = &[("acc0", "net0"), ("net0", "acc0")];

const STREAMS: &str = r#"
    streams: [
        { name: "R1", type: "ipv4", pps: 10, "ipv4-destination-address": "10.1.0.1" },
        { name: "BE", "stream-group-id": 1, type: "ipv4", direction: "both", pps: 10 },
    ],
    "session-traffic": { "ipv4-pps": 10 },
"#;

fn request(h: &Harness, request: Value) -> Value {
    let response = handle_json(&h.engine, &request.to_string());
    serde_json::from_str(&response).unwrap()
}

fn enabled(h: &Harness, flow_id: u64) -> bool {
    h.engine.registry().get(flow_id).unwrap().is_enabled()
}

#[test]
fn test_stream_stats_counts_flows() {
    let mut h = Harness::new(config(STREAMS));
    let response = request(&h, json!({"command": "stream-stats"}));
    assert_eq!(response["status"], "ok");
    assert_eq!(response["code"], 200);
    assert_eq!(
        response["stream-stats"],
        json!({
            "total-flows": 3,
            "verified-flows": 0,
            "session-traffic-flows": 2,
            "session-traffic-flows-verified": 0,
        })
    );

    h.drive_loopback(0..=200, PEERS);
    let response = request(&h, json!({"command": "stream-stats"}));
    assert_eq!(response["stream-stats"]["verified-flows"], 3);
    assert_eq!(response["stream-stats"]["session-traffic-flows-verified"], 2);
}

#[test]
fn test_stream_info_and_not_found() {
    let mut h = Harness::new(config(STREAMS));
    h.drive_loopback(0..=200, PEERS);

    let response = request(&h, json!({"command": "stream-info", "arguments": {"flow-id": 1}}));
    assert_eq!(response["code"], 200);
    let info = &response["stream-info"];
    assert_eq!(info["name"], "R1");
    assert_eq!(info["direction"], "downstream");
    assert_eq!(info["verified"], true);
    assert_eq!(info["destination-address"], "10.1.0.1");
    assert!(info.get("tcp-flags").is_none());

    let response = request(
        &h,
        json!({"command": "stream-info", "arguments": {"flow-id": 1, "debug": true}}),
    );
    assert_eq!(response["stream-info"]["tcp-flags"], 0x10);

    let response = request(&h, json!({"command": "stream-info", "arguments": {"flow-id": 42}}));
    assert_eq!(response["status"], "warning");
    assert_eq!(response["code"], 404);
    assert_eq!(response["message"], "stream not found");

    let response = request(&h, json!({"command": "stream-info"}));
    assert_eq!(response["code"], 400);
}

#[test]
fn test_session_streams() {
    let h = Harness::new(config(STREAMS));
    let response = request(&h, json!({"command": "session-streams", "session-id": 1}));
    assert_eq!(response["code"], 200);
    let body = &response["session-streams"];
    assert_eq!(body["session-id"], 1);
    assert_eq!(body["session-traffic-flows"], 2);
    assert_eq!(body["streams"].as_array().unwrap().len(), 4);

    let response = request(&h, json!({"command": "session-streams", "session-id": 9}));
    assert_eq!(response["code"], 404);
    assert_eq!(response["message"], "session not found");
}

#[test]
fn test_summary_filters() {
    let h = Harness::new(config(STREAMS));
    let all = request(&h, json!({"command": "stream-summary"}));
    assert_eq!(all["stream-summary"].as_array().unwrap().len(), 5);

    let up = request(
        &h,
        json!({"command": "stream-summary", "arguments": {"direction": "upstream"}}),
    );
    let up = up["stream-summary"].as_array().unwrap();
    assert_eq!(up.len(), 2);
    assert!(up.iter().all(|s| s["direction"] == "upstream"));

    let named = request(
        &h,
        json!({"command": "stream-summary", "arguments": {"name": "BE", "interface": "net0"}}),
    );
    let named = named["stream-summary"].as_array().unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0]["flow-id"], 5);

    let grouped = request(
        &h,
        json!({"command": "stream-summary", "arguments": {"session-group-id": 1}}),
    );
    assert_eq!(grouped["stream-summary"].as_array().unwrap().len(), 4);
}

#[test]
fn test_stop_and_start_skip_session_traffic() {
    let h = Harness::new(config(STREAMS));
    let response = request(&h, json!({"command": "stream-stop"}));
    assert_eq!(response["code"], 200);
    for stream in h.engine.registry().all() {
        assert_eq!(stream.is_enabled(), stream.session_traffic, "{stream:?}");
    }

    request(&h, json!({"command": "stream-start", "session-id": 1}));
    assert!(!enabled(&h, 1));
    assert!(enabled(&h, 4) && enabled(&h, 5));

    request(&h, json!({"command": "stream-start", "arguments": {"flow-id": 1}}));
    assert!(enabled(&h, 1));

    let response = request(&h, json!({"command": "stream-stop", "session-id": 7}));
    assert_eq!(response["code"], 404);
}

#[test]
fn test_bidirectional_verified_only_waits_for_both() {
    let mut h = Harness::new(config(STREAMS));
    let stop = json!({
        "command": "stream-stop",
        "session-id": 1,
        "arguments": {"bidirectional-verified-only": true},
    });

    request(&h, stop.clone());
    assert!(enabled(&h, 4) && enabled(&h, 5));

    // Flows 2 and 3 are session traffic; verify only the BE upstream flow.
    let mut egress = CaptureEgress::new();
    h.drive(&mut egress, 0..=50);
    let frame = egress
        .on("acc0")
        .find(|f| parse(f).1.flow_id == 4)
        .unwrap()
        .to_vec();
    let (parsed, header) = parse(&frame);
    h.engine.rx(
        &RxPacket {
            frame: &parsed,
            header: &header,
            interface: "net0",
            timestamp: at_ms(60),
        },
        MacCheck::Skip,
    );
    assert!(h.engine.registry().get(4).unwrap().is_verified());
    assert!(!h.engine.registry().get(5).unwrap().is_verified());

    request(&h, stop.clone());
    assert!(enabled(&h, 4) && enabled(&h, 5));

    h.drive_loopback(61..=300, PEERS);
    request(&h, stop);
    assert!(!enabled(&h, 4) && !enabled(&h, 5));
    assert!(enabled(&h, 1));
}

#[test]
fn test_stop_verified_and_pending() {
    let mut h = Harness::new(config(STREAMS));
    let pending = request(&h, json!({"command": "streams-pending"}));
    assert_eq!(pending["streams-pending"].as_array().unwrap().len(), 5);

    // Only the raw stream gets sent and received.
    h.engine.registry().get(4).unwrap().set_enabled(false);
    h.engine.registry().get(5).unwrap().set_enabled(false);
    h.drive_loopback(0..=200, PEERS);

    let pending = request(&h, json!({"command": "streams-pending"}));
    assert_eq!(pending["streams-pending"], json!([4, 5]));

    request(&h, json!({"command": "stream-start", "session-id": 1}));
    request(&h, json!({"command": "stream-stop-verified"}));
    assert!(!enabled(&h, 1));
    assert!(enabled(&h, 4) && enabled(&h, 5));
}

#[test]
fn test_update_tcp_flags() {
    let h = Harness::new(config(STREAMS));
    let response = request(
        &h,
        json!({"command": "stream-update", "arguments": {"flow-id": 1, "tcp-flags": "syn-ack"}}),
    );
    assert_eq!(response["code"], 200);
    assert_eq!(h.engine.registry().get(1).unwrap().tcp_flags(), 0x12);

    let response = request(
        &h,
        json!({"command": "stream-update", "arguments": {"flow-id": 1, "tcp-flags": "psh"}}),
    );
    assert_eq!(response["code"], 400);
    assert_eq!(h.engine.registry().get(1).unwrap().tcp_flags(), 0x12);
}

#[test]
fn test_reset_and_malformed_requests() {
    let mut h = Harness::new(config(STREAMS));
    h.drive_loopback(0..=200, PEERS);
    let response = request(&h, json!({"command": "stream-reset"}));
    assert_eq!(response, json!({"status": "ok", "code": 200}));
    assert_eq!(h.engine.flows().verified_flows, 0);
    assert_eq!(h.engine.flows().session_traffic_flows_verified, 2);

    let response: Value = serde_json::from_str(&handle_json(&h.engine, "{ not json")).unwrap();
    assert_eq!(response["status"], "error");
    assert_eq!(response["code"], 400);

    let response = request(&h, json!({"command": "stream-teleport"}));
    assert_eq!(response["code"], 400);
    assert_eq!(response["message"], "unknown command");
}
