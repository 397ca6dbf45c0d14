// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::io::Write;
use tempfile::NamedTempFile;
use traffic_streams::config::ConfigError;
use traffic_streams::directory::StaticDirectory;
use traffic_streams::Config;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_json5_file() {
    let file = write_config(
        r#"{
            // pacing
            traffic: { "stop-verified": true, "max-burst": 4 },
            streams: [
                {
                    name: "R1",
                    type: "ipv6",
                    pps: 0.5,
                    "ipv6-destination-address": "2001:db8::1",
                },
            ],
            topology: {
                interfaces: [
                    { name: "net0", role: "network", ipv6: "2001:db8:1::1", "tx-channels": 2 },
                ],
            },
        }"#,
    );
    let config = Config::load_from_file(file.path()).unwrap();
    assert!(config.validate().is_ok());
    assert!(config.traffic.stop_verified);
    assert_eq!(config.traffic.max_burst, 4);
    assert_eq!(config.streams[0].pps, 0.5);

    let directory = StaticDirectory::from_config(&config.topology).unwrap();
    assert!(directory.session_ids().is_empty());
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json5");
    assert!(matches!(Config::load_from_file(&path), Err(ConfigError::Io(..))));
}

#[test]
fn test_malformed_file() {
    let file = write_config("{ streams: [ { name: ");
    assert!(matches!(
        Config::load_from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_validation_errors_from_file() {
    let file = write_config(
        r#"{
            streams: [
                { name: "A", "stream-group-id": 2, type: "ipv4", pps: 10 },
                { name: "A", "stream-group-id": 2, type: "ipv6", pps: 10 },
            ],
        }"#,
    );
    let config = Config::load_from_file(file.path()).unwrap();
    assert_eq!(
        config.validate(),
        Err(ConfigError::DuplicateStream {
            name: "A".into(),
            group_id: 2
        })
    );

    let file = write_config(
        r#"{
            streams: [
                { name: "A", type: "ipv4", pps: 10, "network-interface": "eth9",
                  "ipv4-destination-address": "10.1.0.1" },
            ],
            topology: { interfaces: [ { name: "net0", role: "network" } ] },
        }"#,
    );
    let config = Config::load_from_file(file.path()).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::UnknownInterface { .. })
    ));
}

#[test]
fn test_written_config_reloads() {
    let original = Config::parse(
        r#"{ streams: [ { name: "R1", pps: 10, "ipv4-destination-address": "10.1.0.1" } ] }"#,
    )
    .unwrap();
    let file = write_config(&original.to_json5());
    assert_eq!(Config::load_from_file(file.path()).unwrap(), original);
}
