use blipmqtt::config::load_config;
use blipmqtt::core::topics::WildcardPolicy;
use blipmqtt::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("blipmqtt.toml").expect("failed to load config");

    assert_eq!(cfg.server.bind_addr, "0.0.0.0:1883");
    assert_eq!(cfg.server.max_connections, 1024);
    assert_eq!(cfg.server.connect_timeout_ms, 10_000);
    assert_eq!(cfg.server.max_packet_size, 16 * 1024 * 1024);
    assert_eq!(cfg.session.max_queued_packets, 1000);
    assert_eq!(cfg.session.ack_timeout_ms, 10_000);
    assert_eq!(cfg.session.keep_alive_grace, 1.5);
    assert_eq!(cfg.retry.send_tries, 5);
    assert_eq!(cfg.retry.send_delay_ms, 450);
    assert_eq!(cfg.retry.recv_tries, 10);
    assert_eq!(cfg.retry.recv_delay_ms, 500);
    assert_eq!(cfg.wildcard_policy(), WildcardPolicy::Strict);
    assert!(cfg.auth.allow_anonymous);
    assert!(cfg.auth.users.is_empty());
}

#[test]
fn env_overrides_win_over_file() {
    let mut cfg = load_config("blipmqtt.toml").expect("failed to load config");
    cfg.apply_overrides(|key| match key {
        "BLIPMQTT_BIND_ADDR" => Some("127.0.0.1:1884".to_string()),
        "BLIPMQTT_MAX_CONNECTIONS" => Some("8".to_string()),
        _ => None,
    })
    .expect("valid overrides");
    assert_eq!(cfg.server.bind_addr, "127.0.0.1:1884");
    assert_eq!(cfg.server.max_connections, 8);
}
