//! Kernel operations behind one trait
//!
//! Everything the pool, the device managers and the topology do to the kernel
//! goes through [`Fabric`]. [`NetlinkFabric`] talks to the real kernel over
//! rtnetlink; [`MemoryFabric`] keeps the same semantics in process memory.
//!
//! Semantics every implementation must keep:
//! - link names are unique within a namespace
//! - deleting one veth end deletes its peer, wherever the peer lives
//! - moving a link changes its namespace, never copies it
//! - a veth pair is created whole or not at all

mod memory;
mod netlink;

pub use memory::MemoryFabric;
pub use netlink::NetlinkFabric;

use crate::netem::NetemConfig;
use crate::netns::NetNs;
use crate::port::Port;
use crate::Result;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::path::Path;

#[async_trait]
pub trait Fabric: Send + Sync {
    /// Create a named namespace if absent; `true` when it was created
    async fn create_netns(&self, netns: &NetNs) -> Result<bool>;

    /// Remove a named namespace; missing namespaces are not an error
    async fn remove_netns(&self, netns: &NetNs) -> Result<()>;

    async fn netns_exists(&self, netns: &NetNs) -> bool;

    /// Named namespaces directly under `dir` whose name starts with `prefix`
    async fn list_netns(&self, dir: &Path, prefix: &str) -> Result<Vec<NetNs>>;

    /// Every link in the namespace, loopback included
    async fn ports(&self, netns: &NetNs) -> Result<Vec<Port>>;

    async fn port_by_name(&self, netns: &NetNs, name: &str) -> Result<Option<Port>>;

    async fn port_by_index(&self, netns: &NetNs, index: u32) -> Result<Option<Port>>;

    /// Create a veth pair with both ends inside `netns`
    async fn create_veth(&self, netns: &NetNs, name: &str, peer: &str) -> Result<(Port, Port)>;

    /// Move the link with `index` from `from` into `to`
    async fn move_port(&self, from: &NetNs, index: u32, to: &NetNs) -> Result<()>;

    /// Delete a link; for veths this removes the peer as well
    async fn delete_port(&self, netns: &NetNs, index: u32) -> Result<()>;

    async fn set_port_up(&self, netns: &NetNs, index: u32, up: bool) -> Result<()>;

    async fn rename_port(&self, netns: &NetNs, index: u32, name: &str) -> Result<()>;

    async fn set_hw_addr(&self, netns: &NetNs, index: u32, hw: Vec<u8>) -> Result<()>;

    async fn set_mtu(&self, netns: &NetNs, index: u32, mtu: u32) -> Result<()>;

    /// Create a Linux bridge, administratively down
    async fn create_bridge(&self, netns: &NetNs, name: &str) -> Result<Port>;

    /// Enslave the link to a bridge, or release it with `None`
    async fn set_controller(&self, netns: &NetNs, index: u32, controller: Option<u32>) -> Result<()>;

    async fn add_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()>;

    async fn del_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()>;

    /// Replace the root qdisc of the named link with netem
    async fn set_netem(&self, netns: &NetNs, name: &str, config: &NetemConfig) -> Result<()>;
}
