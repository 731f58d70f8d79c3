//! Tests for configuration validation

use std::time::Duration;

use task_balancer::config::BalancerConfig;

#[test]
fn test_balancer_config_defaults() {
    let cfg = BalancerConfig::new();
    assert_eq!(cfg.progress_interval_ms, 1000);
    assert_eq!(cfg.tasks_collection, "tasks");
    assert_eq!(cfg.intake_warn_depth, 1000);
    assert!(cfg.task_stack_size.is_none());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_balancer_config_invalid_interval() {
    let cfg = BalancerConfig::new().with_progress_interval(Duration::ZERO);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_balancer_config_blank_resource() {
    let cfg = BalancerConfig::new().with_initial_resources(["system", "  "]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_balancer_config_invalid_stack_size() {
    let cfg = BalancerConfig::new().with_task_stack_size(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_balancer_config_from_json() {
    let cfg = BalancerConfig::from_json_str(
        r#"{"progress_interval_ms": 200, "initial_resources": ["system", "network"]}"#,
    )
    .unwrap();
    assert_eq!(cfg.progress_interval(), Duration::from_millis(200));
    assert_eq!(cfg.initial_resources, vec!["system", "network"]);
    assert_eq!(cfg.tasks_collection, "tasks");
}

#[test]
fn test_balancer_config_from_json_rejects_invalid() {
    assert!(BalancerConfig::from_json_str(r#"{"intake_warn_depth": 0}"#).is_err());
    assert!(BalancerConfig::from_json_str("not json").is_err());
}

#[test]
fn test_balancer_config_roundtrip_serde() {
    let cfg = BalancerConfig::new()
        .with_tasks_collection("jobs")
        .with_task_stack_size(2 << 20);
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(BalancerConfig::from_json_str(&json).unwrap(), cfg);
}
