use crate::netns::NetNs;
use crate::node::{Labels, Node, Properties};
use crate::port::Port;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Host state, derived from the node on every query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Unknown,
    Ready,
    Running,
    Error,
    Stopped,
    Removed,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            HostState::Unknown => "unknown",
            HostState::Ready => "ready",
            HostState::Running => "running",
            HostState::Error => "error",
            HostState::Stopped => "stopped",
            HostState::Removed => "removed",
        };
        f.write_str(state)
    }
}

/// A node placed in the topology
pub struct Host {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: Mutex<DateTime<Utc>>,
    labels: Labels,
    node: Arc<dyn Node>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.node.device())
            .field("node", &self.node.id())
            .finish()
    }
}

impl Host {
    pub(crate) fn new(name: String, labels: Labels, node: Arc<dyn Node>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_at: now,
            updated_at: Mutex::new(now),
            labels,
            node,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Friendly name taken from the node; not unique
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        self.node.device()
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.lock()
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn netns(&self) -> NetNs {
        self.node.netns()
    }

    fn touch(&self) {
        *self.updated_at.lock() = Utc::now();
    }

    /// `Removed` when the node can not be inspected, otherwise `Running` or
    /// `Ready` depending on the node's run state.
    pub async fn state(&self) -> HostState {
        if self.node.info().await.is_err() {
            return HostState::Removed;
        }
        if self.node.running().await {
            HostState::Running
        } else {
            HostState::Ready
        }
    }

    async fn require(&self, expected: HostState) -> Result<HostState> {
        let actual = self.state().await;
        if actual != expected {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                expected,
                actual,
            });
        }
        Ok(actual)
    }

    /// Start the node; only valid from `Ready`
    pub async fn start(&self) -> Result<()> {
        self.require(HostState::Ready).await?;
        self.node.start().await?;
        self.touch();
        info!("Started host {} ({})", self.name, self.id);
        Ok(())
    }

    /// Stop the node; only valid from `Running`
    pub async fn stop(&self) -> Result<()> {
        self.require(HostState::Running).await?;
        self.node.stop().await?;
        self.touch();
        info!("Stopped host {} ({})", self.name, self.id);
        Ok(())
    }

    pub async fn info(&self) -> Result<Properties> {
        self.node.info().await
    }

    /// Ports of a host that is ready or running
    pub async fn ports(&self) -> Result<Vec<Port>> {
        match self.state().await {
            HostState::Ready | HostState::Running => self.node.ports().await,
            actual => Err(Error::InvalidState {
                id: self.id.clone(),
                expected: HostState::Ready,
                actual,
            }),
        }
    }

    /// Stats of a running host
    pub async fn stats(&self) -> Result<Properties> {
        self.require(HostState::Running).await?;
        self.node.stats().await
    }
}
