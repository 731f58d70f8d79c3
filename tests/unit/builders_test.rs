//! Tests for builder modules

use std::sync::Arc;

use task_balancer::builders::BalancerBuilder;
use task_balancer::config::BalancerConfig;
use task_balancer::core::{BalancerError, Datastore, StorageSemantics, TaskRegistry};
use task_balancer::infra::InMemoryDatastore;

#[test]
fn test_builder_declares_tasks_collection() {
    let store = Arc::new(InMemoryDatastore::new());
    let balancer = BalancerBuilder::new(TaskRegistry::new())
        .config(BalancerConfig::new().with_tasks_collection("jobs"))
        .datastore(Arc::clone(&store) as Arc<dyn Datastore>)
        .build()
        .unwrap();
    assert_eq!(
        store.semantics("jobs"),
        Some(vec![StorageSemantics::Serial, StorageSemantics::Log])
    );
    assert_eq!(balancer.intake_depth(), 0);
}

#[test]
fn test_start_twice_then_shutdown() {
    let balancer = BalancerBuilder::new(TaskRegistry::new()).build_started().unwrap();
    assert!(balancer.start().is_ok());
    balancer.shutdown();
    assert!(matches!(balancer.start(), Err(BalancerError::Shutdown)));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = BalancerBuilder::new(TaskRegistry::new())
        .config(BalancerConfig::new().with_intake_warn_depth(0))
        .build();
    assert!(matches!(result, Err(BalancerError::InvalidConfig(_))));
}
