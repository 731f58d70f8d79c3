//! Tests for error types

use task_balancer::core::{BalancerError, ValidationError};

#[test]
fn test_unknown_task_type_error() {
    let err = BalancerError::UnknownTaskType("zfs.pool.scrub".to_string());
    assert_eq!(format!("{err}"), "unknown task type zfs.pool.scrub");
    assert!(err.is_invalid_argument());
}

#[test]
fn test_schema_violation_error() {
    let err = BalancerError::SchemaViolation(vec![ValidationError::new("0", "type", "bad")]);
    assert_eq!(format!("{err}"), "schema verification failed");
    assert_eq!(err.validation_errors().len(), 1);
}

#[test]
fn test_verification_error() {
    let err = BalancerError::Verification("pool missing".to_string());
    assert_eq!(format!("{err}"), "verification failed: pool missing");
    assert!(err.is_invalid_argument());
    assert!(err.validation_errors().is_empty());
}

#[test]
fn test_spawn_error_from_io() {
    let err: BalancerError = std::io::Error::other("no threads left").into();
    assert!(matches!(err, BalancerError::Spawn(_)));
    assert!(!err.is_invalid_argument());
}

#[test]
fn test_shutdown_error() {
    assert_eq!(format!("{}", BalancerError::Shutdown), "balancer is shut down");
}
