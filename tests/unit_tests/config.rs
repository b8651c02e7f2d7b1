use pebble_rpc::cfg::cli::resolve_config_path;
use pebble_rpc::cfg::config::Config;
use pebble_rpc::cfg::enums::{CodecConfig, HeadDialectConfig};

#[test]
fn loads_the_fixture_yaml_and_normalizes_it() {
    let cfg = resolve_config_path("tests/fixtures/pebble.yaml")
        .and_then(Config::load_from_file)
        .expect("load fixture config");

    assert_eq!(cfg.rpc.codec, CodecConfig::Binary);
    assert_eq!(cfg.rpc.head_dialect, HeadDialectConfig::Thrift);
    assert_eq!(cfg.rpc.listen, vec!["tcp://127.0.0.1:7500".to_string()]);
    assert_eq!(cfg.rpc.default_timeout_ms, 5_000);
    assert_eq!(cfg.runtime.stack_size_kb, 256);
}

#[test]
fn resolve_config_path_rejects_a_nonexistent_file() {
    assert!(resolve_config_path("tests/fixtures/does_not_exist.yaml").is_err());
}
