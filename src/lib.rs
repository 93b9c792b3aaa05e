//! Ephemeral virtual network topologies on a single host
//!
//! This crate builds and tears down sites (isolated network environments) and
//! switches connected by veth links, optionally impaired with netem. The core
//! pieces are:
//!
//! - [`pool::PortPool`]: a dedicated network namespace holding idle veth ends
//! - [`node::Manager`] / [`node::Node`]: the per-device-kind capability traits
//! - [`registry::Registry`]: lookup from device kind to its manager
//! - [`topology::Topology`]: hosts wrapping nodes, and links derived from veth
//!   peering on demand
//!
//! All kernel work goes through the [`fabric::Fabric`] trait, implemented over
//! rtnetlink by [`fabric::NetlinkFabric`] and in memory by
//! [`fabric::MemoryFabric`].

pub mod config;
pub mod fabric;
pub mod managers;
pub mod netem;
pub mod netns;
pub mod node;
pub mod pool;
pub mod port;
pub mod registry;
pub mod topology;

// Re-export commonly used types
pub use config::{Config, PoolConfig};
pub use fabric::{Fabric, MemoryFabric, NetlinkFabric};
pub use netem::NetemConfig;
pub use netns::NetNs;
pub use node::{Labels, Manager, Node, NodeFilter, Properties};
pub use pool::PortPool;
pub use port::{Port, PortFilter, PortKind, PortStats};
pub use registry::Registry;
pub use topology::{Host, HostFilter, HostState, Link, LinkFailure, LinkStage, Topology};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network namespace error: {0}")]
    NetNs(#[from] netns::NetNsError),

    #[error("Port error: {0}")]
    Port(#[from] port::PortError),

    #[error("Device manager not found: {0}")]
    ManagerNotFound(String),

    #[error("Device manager '{0}' has not been set up")]
    NotSetUp(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Host {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: HostState,
        actual: HostState,
    },

    #[error("Link error: {0}")]
    Link(#[from] LinkFailure),

    #[error("Node operation failed: {0}")]
    Node(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
