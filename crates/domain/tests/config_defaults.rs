use nerve_domain::config::Config;

#[test]
fn default_listen_addr_is_loopback() {
    let config = Config::default();
    assert_eq!(config.api.listen_addr, "127.0.0.1:8470");
}

#[test]
fn explicit_listen_addr_parses() {
    let toml_str = r#"
[api]
listen_addr = "0.0.0.0:9000"
message_wait_seconds = 3
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.api.listen_addr, "0.0.0.0:9000");
    assert_eq!(config.api.message_wait_seconds, 3);
}

#[test]
fn env_overrides_beat_file_values() {
    let toml_str = r#"
[scheduler]
tick_seconds = 7

[fsm]
initial_state = "listening"
"#;
    let mut config: Config = toml::from_str(toml_str).unwrap();
    config.apply_env(|key| match key {
        "SCHEDULER_TICK_SECONDS" => Some("2".to_string()),
        _ => None,
    });
    assert_eq!(config.scheduler.tick_seconds, 2, "environment wins");
    assert_eq!(config.fsm.initial_state, "listening", "untouched keys keep file values");
}

#[test]
fn partial_file_fills_with_defaults() {
    let toml_str = "[slices]\ndefault_cycles = 5\n";
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.slices.default_cycles, 5);
    assert_eq!(config.fsm.initial_state, "idle");
    assert_eq!(config.observability.non_error_ttl_days, 14);
    assert_eq!(config.observability.error_ttl_days, 30);
}
