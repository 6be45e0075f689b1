use control_plane::{default_config_template, ConfigError, SystemConfigLoader};

#[test]
fn default_template_parses() {
    let config = SystemConfigLoader::from_str(&default_config_template()).expect("parse");
    assert_eq!(config.get_string("security.admin_token"), "change-me");
    assert_eq!(config.get_string("upstream.base_url"), "http://127.0.0.1:9000");
    assert_eq!(config.get_number("llm.timeout_ms"), 5000);
}

#[test]
fn missing_keys_fall_back_to_defaults() {
    let config = SystemConfigLoader::from_str("cache = { redis_url = \"\" }").expect("parse");
    assert_eq!(config.get_number("upstream.timeout_ms"), 30_000);
    assert_eq!(config.get_string("llm.fast_model"), "llama3.2:3b");
}

#[test]
fn unknown_keys_are_rejected() {
    let result = SystemConfigLoader::from_str("mystery = { key = \"value\" }");
    assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
}

#[test]
fn type_mismatch_is_rejected() {
    let result = SystemConfigLoader::from_str("upstream = { timeout_ms = \"soon\" }");
    assert!(matches!(result, Err(ConfigError::TypeMismatch(_, _))));
}
