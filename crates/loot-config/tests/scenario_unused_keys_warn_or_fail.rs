use loot_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigMode, UnusedKeyPolicy};

/// scenario_unused_keys_warn_or_fail
///
/// 1) Unused keys are detected in WARN mode but do not error.
/// 2) Unused keys cause failure in FAIL mode.
/// 3) Keys under consumed prefixes are not flagged.
/// 4) Deterministic ordering of unused pointers.

#[test]
fn warn_mode_reports_unused_keys_without_error() {
    let yaml = r#"
nonce:
  ttl_secs: 120

unused_section:
  foo: 123
  bar: 456
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(!report.is_clean(), "report should detect unused keys");
    assert!(report
        .unused_leaf_pointers
        .contains(&"/unused_section/foo".to_string()));
    assert!(report
        .unused_leaf_pointers
        .contains(&"/unused_section/bar".to_string()));
    assert!(!report
        .unused_leaf_pointers
        .contains(&"/nonce/ttl_secs".to_string()));
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let yaml = r#"
gateway:
  completion_ttl_ms: 5000
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    // The daemon never reads /gateway.
    let result = report_unused_keys(ConfigMode::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail);
    assert!(result.is_err(), "fail policy must error when unused keys exist");
    let msg = format!("{:?}", result.err().unwrap());
    assert!(msg.contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn consumed_prefix_covers_nested_keys() {
    let yaml = r#"
rate_limits:
  claim_submit:
    window_secs: 60
    max_requests: 5
    class: mutating
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");
    assert!(report.is_clean(), "rate_limits subtree is consumed by the daemon");
}

#[test]
fn operator_mode_only_consumes_named_leaves() {
    let yaml = r#"
reconcile:
  direction: instances
  concurrency: 8
  interval_secs: 300
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report =
        report_unused_keys(ConfigMode::Operator, &loaded.config_json, UnusedKeyPolicy::Warn)
            .expect("warn mode must not error");
    assert_eq!(
        report.unused_leaf_pointers,
        vec!["/reconcile/interval_secs".to_string()]
    );
}

#[test]
fn deterministic_unused_pointer_ordering() {
    let yaml = r#"
unused:
  b: 2
  a: 1
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::Client, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");
    assert_eq!(
        report.unused_leaf_pointers,
        vec!["/unused/a".to_string(), "/unused/b".to_string()],
    );
}
