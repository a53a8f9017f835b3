#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use medrelay_gateway::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
gateway:
  listen: "0.0.0.0:8888"
chat:
  max_poll_timeout_secs: 30 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.client_code().as_str(), "BAD_REQUEST");
}

#[test]
fn ok_minimal_config() {
    let cfg = config::load_from_str("version: 1\n").expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.gateway.listen, "0.0.0.0:8888");
    assert_eq!(cfg.gateway.ops_listen, None);
    assert_eq!(cfg.protocol.file_chunk_bytes, 64 * 1024);
    assert_eq!(cfg.files.base_dir, "files");
    assert_eq!(cfg.chat.default_poll_limit, 50);
    assert_eq!(cfg.chat.max_poll_limit, 200);
}

#[test]
fn sample_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../medrelay.yaml");
    let cfg = config::load_from_file(path).expect("sample config must load");
    assert_eq!(cfg.gateway.ops_listen.as_deref(), Some("127.0.0.1:9090"));
}

#[test]
fn rejects_wrong_version() {
    let err = config::load_from_str("version: 2\n").expect_err("must fail");
    assert_eq!(err.client_code().as_str(), "UNSUPPORTED_VERSION");
}

#[test]
fn rejects_out_of_range_values() {
    let cases = [
        "version: 1\ngateway:\n  idle_timeout_ms: 5\n",
        "version: 1\ngateway:\n  outbound_queue: 1\n",
        "version: 1\nprotocol:\n  max_packet_bytes: 99999999\n",
        "version: 1\nprotocol:\n  file_chunk_bytes: 16\n",
        "version: 1\nfiles:\n  base_dir: \"  \"\n",
        "version: 1\nchat:\n  max_poll_timeout_sec: 0\n",
        "version: 1\nchat:\n  max_poll_timeout_sec: 60\n",
        "version: 1\nchat:\n  default_poll_limit: 500\n",
    ];
    for yaml in cases {
        let err = config::load_from_str(yaml).expect_err(yaml);
        assert_eq!(err.client_code().as_str(), "BAD_REQUEST", "{yaml}");
    }
}
