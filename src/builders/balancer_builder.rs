//! Builder assembling a [`Balancer`] from configuration and collaborators.

use std::sync::Arc;

use crate::config::BalancerConfig;
use crate::core::{
    Balancer, BalancerError, Datastore, DefaultValidator, EventSink, ResourceGraph, TaskRegistry, Validator,
};
use crate::infra::{InMemoryDatastore, TracingEventSink};

/// Assemble a balancer, falling back to in-process defaults for every
/// collaborator not supplied: a tracing event sink, an in-memory datastore,
/// an empty resource graph, and the default schema validator.
pub struct BalancerBuilder {
    registry: TaskRegistry,
    config: BalancerConfig,
    events: Option<Arc<dyn EventSink>>,
    datastore: Option<Arc<dyn Datastore>>,
    resource_graph: Option<Arc<ResourceGraph>>,
    validator: Option<Arc<dyn Validator>>,
}

impl BalancerBuilder {
    /// Start from a task registry and the default configuration.
    #[must_use]
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            config: BalancerConfig::default(),
            events: None,
            datastore: None,
            resource_graph: None,
            validator: None,
        }
    }

    /// Use the given configuration.
    #[must_use]
    pub fn config(mut self, config: BalancerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish lifecycle events to `events`.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Persist task snapshots to `datastore`.
    #[must_use]
    pub fn datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Share an existing resource graph.
    #[must_use]
    pub fn resource_graph(mut self, graph: Arc<ResourceGraph>) -> Self {
        self.resource_graph = Some(graph);
        self
    }

    /// Validate arguments with a custom validator.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Build the balancer without starting its distribution loop.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::InvalidConfig`] or [`BalancerError::Datastore`]
    /// from [`Balancer::new`].
    pub fn build(self) -> Result<Balancer, BalancerError> {
        Balancer::new(
            self.config,
            self.registry,
            self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            self.datastore.unwrap_or_else(|| Arc::new(InMemoryDatastore::new())),
            self.resource_graph.unwrap_or_default(),
            self.validator.unwrap_or_else(|| Arc::new(DefaultValidator)),
        )
    }

    /// Build the balancer and start its distribution loop.
    ///
    /// # Errors
    ///
    /// Any error from [`BalancerBuilder::build`] or [`Balancer::start`].
    pub fn build_started(self) -> Result<Balancer, BalancerError> {
        let balancer = self.build()?;
        balancer.start()?;
        Ok(balancer)
    }
}
