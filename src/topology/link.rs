use super::host::Host;
use crate::fabric::Fabric;
use crate::netem::{self, NetemConfig};
use crate::port::Port;
use crate::{Error, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// One end of a link: a port resident in a host's namespace
#[derive(Clone, Debug)]
pub struct LinkEnd {
    host: Arc<Host>,
    port: Port,
}

impl LinkEnd {
    pub(crate) fn new(host: Arc<Host>, port: Port) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn port(&self) -> &Port {
        &self.port
    }
}

/// Two hosts joined by a veth pair. Derived from kernel state, never stored.
#[derive(Clone, Debug)]
pub struct Link {
    local: LinkEnd,
    peer: LinkEnd,
}

/// Flat view of a link
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkSummary {
    pub self_host_id: String,
    pub self_host_name: String,
    pub self_port: String,
    pub self_index: u32,
    pub peer_host_id: String,
    pub peer_host_name: String,
    pub peer_port: String,
    pub peer_index: u32,
}

/// Host/port pair identifying a link regardless of direction
pub(crate) type LinkKey = [(String, u32); 2];

impl Link {
    pub(crate) fn new(local: LinkEnd, peer: LinkEnd) -> Self {
        Self { local, peer }
    }

    pub fn local(&self) -> &LinkEnd {
        &self.local
    }

    pub fn peer(&self) -> &LinkEnd {
        &self.peer
    }

    pub(crate) fn key(&self) -> LinkKey {
        let mut key = [
            (self.local.host.id().to_string(), self.local.port.index),
            (self.peer.host.id().to_string(), self.peer.port.index),
        ];
        key.sort();
        key
    }

    pub fn summary(&self) -> LinkSummary {
        LinkSummary {
            self_host_id: self.local.host.id().to_string(),
            self_host_name: self.local.host.name().to_string(),
            self_port: self.local.port.name.clone(),
            self_index: self.local.port.index,
            peer_host_id: self.peer.host.id().to_string(),
            peer_host_name: self.peer.host.name().to_string(),
            peer_port: self.peer.port.name.clone(),
            peer_index: self.peer.port.index,
        }
    }

    /// Apply the same impairment to both ends, so it holds in both directions
    pub async fn set_netem(&self, fabric: &dyn Fabric, config: &NetemConfig) -> Result<()> {
        for end in [&self.local, &self.peer] {
            netem::apply(fabric, &end.host.netns(), &end.port, config).await?;
        }
        Ok(())
    }
}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.summary().serialize(serializer)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local.host.name(),
            self.local.port.name,
            self.peer.host.name(),
            self.peer.port.name
        )
    }
}

/// Step of [`Topology::link`](super::Topology::link) that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStage {
    /// No port pair could be created; nothing to clean up
    Allocate,
    /// The pair exists in the pool; the local attach failed
    SelfAttach,
    /// The local end is attached; the peer end did not follow
    PeerAttach,
}

impl fmt::Display for LinkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            LinkStage::Allocate => "allocate",
            LinkStage::SelfAttach => "self attach",
            LinkStage::PeerAttach => "peer attach",
        };
        f.write_str(stage)
    }
}

/// A link attempt that stopped part way. Nothing is rolled back; `ports`
/// holds both ends as last seen so the caller can clean up.
#[derive(thiserror::Error, Debug)]
#[error("link {stage} failed: {source}")]
pub struct LinkFailure {
    pub stage: LinkStage,
    pub ports: Option<(Port, Port)>,
    pub source: Box<Error>,
}

impl LinkFailure {
    pub(crate) fn new(stage: LinkStage, ports: Option<(Port, Port)>, source: Error) -> Self {
        Self {
            stage,
            ports,
            source: Box::new(source),
        }
    }
}
