//! Builders to construct a balancer from configuration.

pub mod balancer_builder;

pub use balancer_builder::BalancerBuilder;
