//! Configuration models for the balancer.

pub mod balancer;

pub use balancer::BalancerConfig;
