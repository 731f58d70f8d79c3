//! Tests for utility functions

use task_balancer::util::{init_tracing, now_ms};

#[test]
fn test_now_ms_is_monotonic_enough() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
    // After 2020-01-01.
    assert!(a > 1_577_836_800_000);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::debug!("tracing initialized twice");
}
