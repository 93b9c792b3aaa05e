//! In-process fabric
//!
//! Models namespaces, links, addresses and netem settings in a single table
//! keyed by link index. Indexes are unique across all namespaces here, which
//! the kernel does not promise; callers must not rely on either behavior.
//!
//! Process namespaces (`/proc/<pid>/ns/net`) exist implicitly and are added to
//! the table on first use. Every namespace starts with a loopback link.

use super::Fabric;
use crate::netem::NetemConfig;
use crate::netns::{NetNs, NetNsError};
use crate::port::{format_mac, Port, PortError, PortKind, PortStats};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::debug;

const DEFAULT_MTU: u32 = 1500;
const LOOPBACK_MTU: u32 = 65536;

#[derive(Debug, Clone)]
struct MemoryLink {
    netns: NetNs,
    port: Port,
    addresses: Vec<Ipv4Network>,
    netem: Option<NetemConfig>,
}

#[derive(Debug, Default)]
struct MemoryState {
    namespaces: BTreeSet<NetNs>,
    links: BTreeMap<u32, MemoryLink>,
    next_index: u32,
    next_mac: u32,
    failing_moves: HashSet<NetNs>,
}

impl MemoryState {
    fn allocate_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn allocate_mac(&mut self) -> String {
        self.next_mac += 1;
        let n = self.next_mac.to_be_bytes();
        format_mac(&[0x02, 0x00, n[0], n[1], n[2], n[3]])
    }

    fn add_namespace(&mut self, netns: &NetNs) {
        self.namespaces.insert(netns.clone());
        let index = self.allocate_index();
        self.links.insert(
            index,
            MemoryLink {
                netns: netns.clone(),
                port: Port {
                    name: "lo".into(),
                    index,
                    kind: PortKind::Loopback,
                    hw_addr: format_mac(&[0; 6]),
                    mtu: LOOPBACK_MTU,
                    ..Default::default()
                },
                addresses: Vec::new(),
                netem: None,
            },
        );
    }

    /// Make sure the namespace is known, materializing process namespaces
    fn require_ns(&mut self, netns: &NetNs) -> Result<()> {
        if self.namespaces.contains(netns) {
            return Ok(());
        }
        if netns.is_process() {
            self.add_namespace(netns);
            return Ok(());
        }
        Err(NetNsError::NotFound(netns.to_string()).into())
    }

    fn name_taken(&self, netns: &NetNs, name: &str) -> bool {
        self.links
            .values()
            .any(|l| l.netns == *netns && l.port.name == name)
    }

    fn link_mut(&mut self, netns: &NetNs, index: u32) -> Result<&mut MemoryLink> {
        match self.links.get_mut(&index) {
            Some(link) if link.netns == *netns => Ok(link),
            _ => Err(PortError::IndexNotFound {
                index,
                netns: netns.to_string(),
            }
            .into()),
        }
    }

    fn link(&self, netns: &NetNs, index: u32) -> Result<&MemoryLink> {
        match self.links.get(&index) {
            Some(link) if link.netns == *netns => Ok(link),
            _ => Err(PortError::IndexNotFound {
                index,
                netns: netns.to_string(),
            }
            .into()),
        }
    }

    fn by_name(&self, netns: &NetNs, name: &str) -> Option<&MemoryLink> {
        self.links
            .values()
            .find(|l| l.netns == *netns && l.port.name == name)
    }

    fn by_name_mut(&mut self, netns: &NetNs, name: &str) -> Option<&mut MemoryLink> {
        self.links
            .values_mut()
            .find(|l| l.netns == *netns && l.port.name == name)
    }

    /// Remove a link and everything the kernel would take down with it
    fn remove_link(&mut self, index: u32) {
        let Some(link) = self.links.remove(&index) else {
            return;
        };
        match link.port.kind {
            PortKind::Veth => {
                if let Some(peer) = link.port.peer_index {
                    self.links.remove(&peer);
                }
            }
            PortKind::Bridge => {
                for other in self.links.values_mut() {
                    if other.port.controller == Some(index) {
                        other.port.controller = None;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Fabric backed by process memory
#[derive(Debug, Default)]
pub struct MemoryFabric {
    state: Mutex<MemoryState>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Netem settings last applied to the named link
    pub fn netem_of(&self, netns: &NetNs, name: &str) -> Option<NetemConfig> {
        self.state.lock().by_name(netns, name).and_then(|l| l.netem)
    }

    /// Addresses currently assigned to the named link
    pub fn addresses_of(&self, netns: &NetNs, name: &str) -> Vec<Ipv4Network> {
        self.state
            .lock()
            .by_name(netns, name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    /// Overwrite the counters of the named link
    pub fn set_stats(&self, netns: &NetNs, name: &str, stats: PortStats) -> bool {
        match self.state.lock().by_name_mut(netns, name) {
            Some(link) => {
                link.port.stats = stats;
                true
            }
            None => false,
        }
    }

    /// Make every later move into `netns` fail
    pub fn fail_moves_into(&self, netns: &NetNs) {
        self.state.lock().failing_moves.insert(netns.clone());
    }

    /// Total number of links across all namespaces
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn create_netns(&self, netns: &NetNs) -> Result<bool> {
        let mut state = self.state.lock();
        if netns.is_process() {
            state.require_ns(netns)?;
            return Ok(false);
        }
        if state.namespaces.contains(netns) {
            return Ok(false);
        }
        state.add_namespace(netns);
        debug!("Created namespace: {}", netns);
        Ok(true)
    }

    async fn remove_netns(&self, netns: &NetNs) -> Result<()> {
        if netns.is_process() {
            return Err(NetNsError::NotFound(netns.to_string()).into());
        }
        let mut state = self.state.lock();
        if !state.namespaces.remove(netns) {
            return Ok(());
        }
        let resident: Vec<u32> = state
            .links
            .iter()
            .filter(|(_, l)| l.netns == *netns)
            .map(|(index, _)| *index)
            .collect();
        for index in resident {
            state.remove_link(index);
        }
        debug!("Deleted namespace: {}", netns);
        Ok(())
    }

    async fn netns_exists(&self, netns: &NetNs) -> bool {
        netns.is_process() || self.state.lock().namespaces.contains(netns)
    }

    async fn list_netns(&self, dir: &Path, prefix: &str) -> Result<Vec<NetNs>> {
        Ok(self
            .state
            .lock()
            .namespaces
            .iter()
            .filter(|ns| ns.path().parent() == Some(dir) && ns.name().starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ports(&self, netns: &NetNs) -> Result<Vec<Port>> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        Ok(state
            .links
            .values()
            .filter(|l| l.netns == *netns)
            .map(|l| l.port.clone())
            .collect())
    }

    async fn port_by_name(&self, netns: &NetNs, name: &str) -> Result<Option<Port>> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        Ok(state.by_name(netns, name).map(|l| l.port.clone()))
    }

    async fn port_by_index(&self, netns: &NetNs, index: u32) -> Result<Option<Port>> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        Ok(state.link(netns, index).ok().map(|l| l.port.clone()))
    }

    async fn create_veth(&self, netns: &NetNs, name: &str, peer: &str) -> Result<(Port, Port)> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        if name == peer || state.name_taken(netns, name) {
            return Err(PortError::AlreadyExists(name.to_string()).into());
        }
        if state.name_taken(netns, peer) {
            return Err(PortError::AlreadyExists(peer.to_string()).into());
        }

        let (left_index, right_index) = (state.allocate_index(), state.allocate_index());
        let mut ends = Vec::with_capacity(2);
        for (index, end_name, peer_index) in [
            (left_index, name, right_index),
            (right_index, peer, left_index),
        ] {
            let port = Port {
                name: end_name.to_string(),
                index,
                kind: PortKind::Veth,
                hw_addr: state.allocate_mac(),
                mtu: DEFAULT_MTU,
                peer_index: Some(peer_index),
                ..Default::default()
            };
            state.links.insert(
                index,
                MemoryLink {
                    netns: netns.clone(),
                    port: port.clone(),
                    addresses: Vec::new(),
                    netem: None,
                },
            );
            ends.push(port);
        }

        let right = ends.pop();
        let left = ends.pop();
        match (left, right) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(PortError::CreateFailed(format!("{}/{}", name, peer)).into()),
        }
    }

    async fn move_port(&self, from: &NetNs, index: u32, to: &NetNs) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(from)?;
        state.require_ns(to)?;

        if state.failing_moves.contains(to) {
            return Err(Error::Node(format!("moving link {} into {} refused", index, to)));
        }

        let link = state.link(from, index)?;
        if matches!(link.port.kind, PortKind::Loopback | PortKind::Bridge) {
            return Err(Error::Node(format!(
                "link {} ({}) can not change namespace",
                index, link.port.name
            )));
        }
        let name = link.port.name.clone();
        if from == to {
            return Ok(());
        }
        if state.name_taken(to, &name) {
            return Err(PortError::AlreadyExists(name).into());
        }

        // A link entering a new namespace comes up down, unaddressed and
        // detached from any bridge
        let link = state.link_mut(from, index)?;
        link.netns = to.clone();
        link.port.up = false;
        link.port.controller = None;
        link.addresses.clear();
        link.netem = None;
        Ok(())
    }

    async fn delete_port(&self, netns: &NetNs, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        if state.link(netns, index)?.port.kind == PortKind::Loopback {
            return Err(Error::Node(format!("loopback of {} can not be deleted", netns)));
        }
        state.remove_link(index);
        Ok(())
    }

    async fn set_port_up(&self, netns: &NetNs, index: u32, up: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        state.link_mut(netns, index)?.port.up = up;
        Ok(())
    }

    async fn rename_port(&self, netns: &NetNs, index: u32, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        if state.link(netns, index)?.port.name == name {
            return Ok(());
        }
        if state.name_taken(netns, name) {
            return Err(PortError::AlreadyExists(name.to_string()).into());
        }
        state.link_mut(netns, index)?.port.name = name.to_string();
        Ok(())
    }

    async fn set_hw_addr(&self, netns: &NetNs, index: u32, hw: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        state.link_mut(netns, index)?.port.hw_addr = format_mac(&hw);
        Ok(())
    }

    async fn set_mtu(&self, netns: &NetNs, index: u32, mtu: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        state.link_mut(netns, index)?.port.mtu = mtu;
        Ok(())
    }

    async fn create_bridge(&self, netns: &NetNs, name: &str) -> Result<Port> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        if state.name_taken(netns, name) {
            return Err(PortError::AlreadyExists(name.to_string()).into());
        }
        let index = state.allocate_index();
        let port = Port {
            name: name.to_string(),
            index,
            kind: PortKind::Bridge,
            hw_addr: state.allocate_mac(),
            mtu: DEFAULT_MTU,
            ..Default::default()
        };
        state.links.insert(
            index,
            MemoryLink {
                netns: netns.clone(),
                port: port.clone(),
                addresses: Vec::new(),
                netem: None,
            },
        );
        Ok(port)
    }

    async fn set_controller(&self, netns: &NetNs, index: u32, controller: Option<u32>) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        state.link(netns, index)?;
        if let Some(bridge) = controller {
            if state.link(netns, bridge)?.port.kind != PortKind::Bridge {
                return Err(Error::Node(format!("link {} in {} is not a bridge", bridge, netns)));
            }
        }
        state.link_mut(netns, index)?.port.controller = controller;
        Ok(())
    }

    async fn add_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        let link = state.link_mut(netns, index)?;
        if !link.addresses.contains(&address) {
            link.addresses.push(address);
        }
        Ok(())
    }

    async fn del_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        let link = state.link_mut(netns, index)?;
        match link.addresses.iter().position(|a| *a == address) {
            Some(pos) => {
                link.addresses.remove(pos);
                Ok(())
            }
            None => Err(PortError::AddressNotFound {
                address: address.to_string(),
                port: link.port.name.clone(),
            }
            .into()),
        }
    }

    async fn set_netem(&self, netns: &NetNs, name: &str, config: &NetemConfig) -> Result<()> {
        let mut state = self.state.lock();
        state.require_ns(netns)?;
        match state.by_name_mut(netns, name) {
            Some(link) => {
                link.netem = Some(*config);
                Ok(())
            }
            None => Err(PortError::NotFound {
                name: name.to_string(),
                netns: netns.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str) -> NetNs {
        NetNs::named_at("/run/sitelink-test", name)
    }

    #[tokio::test]
    async fn test_new_namespace_has_loopback() {
        let fabric = MemoryFabric::new();
        let a = ns("a");

        assert!(fabric.create_netns(&a).await.unwrap());
        assert!(!fabric.create_netns(&a).await.unwrap());

        let ports = fabric.ports(&a).await.unwrap();
        assert_eq!(ports.len(), 1);
        assert!(ports[0].is_loopback());
        assert!(!ports[0].up);
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_an_error() {
        let fabric = MemoryFabric::new();
        assert!(fabric.ports(&ns("missing")).await.is_err());
        // Process namespaces always exist
        assert!(!fabric.ports(&NetNs::current()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_veth_pair_peers_each_other() {
        let fabric = MemoryFabric::new();
        let a = ns("a");
        fabric.create_netns(&a).await.unwrap();

        let (left, right) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();
        assert_eq!(left.peer_index, Some(right.index));
        assert_eq!(right.peer_index, Some(left.index));
        assert!(left.is_veth());

        // Names are unique per namespace
        assert!(fabric.create_veth(&a, "vpaaaaa", "vpccccc").await.is_err());
    }

    #[tokio::test]
    async fn test_move_and_delete_takes_peer() {
        let fabric = MemoryFabric::new();
        let (a, b) = (ns("a"), ns("b"));
        fabric.create_netns(&a).await.unwrap();
        fabric.create_netns(&b).await.unwrap();

        let (left, right) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();
        fabric.set_port_up(&a, left.index, true).await.unwrap();
        fabric.move_port(&a, left.index, &b).await.unwrap();

        let moved = fabric.port_by_name(&b, "vpaaaaa").await.unwrap().unwrap();
        assert!(!moved.up);
        assert!(fabric.port_by_name(&a, "vpaaaaa").await.unwrap().is_none());

        fabric.delete_port(&b, moved.index).await.unwrap();
        assert!(fabric.port_by_index(&a, right.index).await.unwrap().is_none());
        assert_eq!(fabric.link_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_namespace_takes_peers() {
        let fabric = MemoryFabric::new();
        let (a, b) = (ns("a"), ns("b"));
        fabric.create_netns(&a).await.unwrap();
        fabric.create_netns(&b).await.unwrap();

        let (left, _) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();
        fabric.move_port(&a, left.index, &b).await.unwrap();

        fabric.remove_netns(&b).await.unwrap();
        assert_eq!(fabric.ports(&a).await.unwrap().len(), 1);
        assert!(!fabric.netns_exists(&b).await);
        // Removing again is fine
        fabric.remove_netns(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_release_on_delete() {
        let fabric = MemoryFabric::new();
        let a = ns("a");
        fabric.create_netns(&a).await.unwrap();

        let bridge = fabric.create_bridge(&a, "br0").await.unwrap();
        let (left, _) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();
        fabric.set_controller(&a, left.index, Some(bridge.index)).await.unwrap();
        assert_eq!(
            fabric.port_by_index(&a, left.index).await.unwrap().unwrap().controller,
            Some(bridge.index)
        );

        // Only bridges can be controllers
        assert!(fabric.set_controller(&a, bridge.index, Some(left.index)).await.is_err());

        fabric.delete_port(&a, bridge.index).await.unwrap();
        let left = fabric.port_by_index(&a, left.index).await.unwrap().unwrap();
        assert_eq!(left.controller, None);
    }

    #[tokio::test]
    async fn test_addresses_and_netem() {
        let fabric = MemoryFabric::new();
        let a = ns("a");
        fabric.create_netns(&a).await.unwrap();
        let (left, _) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();

        let net: Ipv4Network = "10.0.0.1/24".parse().unwrap();
        fabric.add_address(&a, left.index, net).await.unwrap();
        fabric.add_address(&a, left.index, net).await.unwrap();
        assert_eq!(fabric.addresses_of(&a, "vpaaaaa"), vec![net]);

        fabric.del_address(&a, left.index, net).await.unwrap();
        assert!(fabric.del_address(&a, left.index, net).await.is_err());

        let config = NetemConfig::new(1000, 0, 0.5);
        fabric.set_netem(&a, "vpaaaaa", &config).await.unwrap();
        assert_eq!(fabric.netem_of(&a, "vpaaaaa"), Some(config));
        assert!(fabric.set_netem(&a, "missing", &config).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_move_failure() {
        let fabric = MemoryFabric::new();
        let (a, b) = (ns("a"), ns("b"));
        fabric.create_netns(&a).await.unwrap();
        fabric.create_netns(&b).await.unwrap();
        fabric.fail_moves_into(&b);

        let (left, _) = fabric.create_veth(&a, "vpaaaaa", "vpbbbbb").await.unwrap();
        assert!(fabric.move_port(&a, left.index, &b).await.is_err());
        assert!(fabric.port_by_name(&a, "vpaaaaa").await.unwrap().is_some());
    }
}
