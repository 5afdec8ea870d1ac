use super::*;

fn temp_root(name: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(name)
        .tempdir()
        .expect("create temp root")
}

#[test]
fn partial_config_files_take_defaults() {
    let root = temp_root("restcov-config-partial");
    let path = root.path().join("restcov.json");
    std::fs::write(&path, r#"{"schema_version": 1, "ca_strength": 3, "cleanup": true}"#)
        .expect("write config");
    let config = load_config(&path).expect("load config");
    assert_eq!(config.ca_strength, 3);
    assert!(config.cleanup);
    assert_eq!(config.sequence_strength, 2);
    assert_eq!(config.chain_capacity, 10);
    assert_eq!(config.tool_command, DEFAULT_TOOL_COMMAND);
}

#[test]
fn written_config_loads_back_unchanged() {
    let root = temp_root("restcov-config-write");
    let path = root.path().join("nested").join("restcov.json");
    let mut config = default_config();
    config.headers.insert("Authorization".to_string(), "Bearer t".to_string());
    config.seed = Some(9);
    write_config(&path, &config).expect("write config");
    assert_eq!(load_config(&path).expect("load config"), config);
}

#[test]
fn stub_is_valid_json_config() {
    let text = serde_json::to_string_pretty(&stub_config()).expect("serialize stub");
    let parsed: RunConfig = serde_json::from_str(&text).expect("parse stub");
    assert_eq!(parsed.base_url.as_deref(), Some("http://localhost:8080"));
    validate_config(&parsed, false).expect("stub validates");
}

#[test]
fn validation_rejects_bad_values() {
    let mut config = default_config();
    config.schema_version = 7;
    assert!(validate_config(&config, false).is_err());

    let mut config = default_config();
    config.ca_strength = 0;
    assert!(validate_config(&config, false).is_err());

    let mut config = default_config();
    config.match_reject = 0.95;
    let err = validate_config(&config, false).expect_err("thresholds out of order");
    assert!(err.to_string().contains("match_reject"), "{err}");

    let mut config = default_config();
    config.base_url = Some("localhost:8080".to_string());
    assert!(validate_config(&config, false).is_err());
}

#[test]
fn missing_tool_binary_is_reported() {
    let mut config = default_config();
    config.tool_command = "restcov-definitely-missing-tool {input} {output}".to_string();
    let err = validate_config(&config, true).expect_err("missing tool");
    assert!(err.to_string().contains("not found"), "{err}");
}
