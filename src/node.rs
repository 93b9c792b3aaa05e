//! Device manager and node contracts
//!
//! A [`Manager`] owns the lifecycle of one device kind; every entity it
//! manages is exposed as a [`Node`]. Node ids are unique within a device kind
//! only.

use crate::netns::NetNs;
use crate::port::Port;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flat key/value configuration and info maps
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Free-form labels attached at creation
pub type Labels = BTreeMap<String, String>;

#[async_trait]
pub trait Manager: Send + Sync {
    /// Device kind served by this manager
    fn device(&self) -> &str;

    /// (Re)configure the manager. Must tolerate repeated calls.
    async fn setup(&self, config: &Properties) -> Result<()>;

    async fn info(&self) -> Result<Properties>;

    fn icon(&self) -> &str;

    fn color(&self) -> &str;

    /// Entities that currently exist, narrowed by `filters`
    async fn nodes(&self, filters: &[NodeFilter]) -> Result<Vec<Arc<dyn Node>>>;

    /// Create one entity. Fails on an empty name.
    async fn add(&self, name: &str, labels: Labels, config: &Properties) -> Result<Arc<dyn Node>>;

    async fn remove(&self, node: &dyn Node) -> Result<()>;
}

#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> String;

    /// Fails when the underlying entity has vanished
    async fn name(&self) -> Result<String>;

    fn device(&self) -> &str;

    /// Start the entity; a no-op when it already runs
    async fn start(&self) -> Result<()>;

    /// Stop the entity; a no-op when it is already stopped
    async fn stop(&self) -> Result<()>;

    /// Best effort; any failure reads as not running
    async fn running(&self) -> bool;

    /// Fails when the entity can not be inspected, which signals removal
    async fn info(&self) -> Result<Properties>;

    fn netns(&self) -> NetNs;

    async fn ports(&self) -> Result<Vec<Port>>;

    /// Take `port` out of the pool and attach it; returns the port as it now
    /// appears inside this node's namespace
    async fn port_add(&self, port: &Port) -> Result<Port>;

    /// Detach `port` and hand it back to the pool
    async fn port_remove(&self, port: &Port) -> Result<()>;

    async fn stats(&self) -> Result<Properties>;
}

/// Predicate used to narrow node listings
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeFilter {
    Name(String),
    Device(String),
    Id(String),
}

impl NodeFilter {
    pub async fn matches(&self, node: &dyn Node) -> bool {
        match self {
            NodeFilter::Name(name) => node.name().await.map(|n| n == *name).unwrap_or(false),
            NodeFilter::Device(device) => node.device() == device,
            NodeFilter::Id(id) => node.id() == *id,
        }
    }
}

/// Apply filters in order, dropping nodes whose name can no longer be read
/// when a name filter is present
pub async fn apply_filters(nodes: Vec<Arc<dyn Node>>, filters: &[NodeFilter]) -> Vec<Arc<dyn Node>> {
    let mut kept = nodes;
    for filter in filters {
        let mut next = Vec::with_capacity(kept.len());
        for node in kept {
            if filter.matches(node.as_ref()).await {
                next.push(node);
            }
        }
        kept = next;
    }
    kept
}
