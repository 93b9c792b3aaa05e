//! Topology: hosts and the links between them
//!
//! Hosts wrap nodes handed out by the registered managers. Links are never
//! stored: every query rebuilds them from veth peering. One discovery pass
//! lists each host's ports once, then matches every veth port against the
//! cached ports of every other host, so the cost is O(hosts x ports) kernel
//! queries and O(hosts x ports^2) comparisons.
//!
//! Two ports form a link when each names the other as its peer. A pair is
//! reported once no matter which side it was found from.

mod host;
mod link;

pub use host::{Host, HostState};
pub use link::{Link, LinkEnd, LinkFailure, LinkStage, LinkSummary};

use crate::netem::{self, NetemConfig};
use crate::node::{Labels, Node, Properties};
use crate::pool::PortPool;
use crate::port::{self, Port};
use crate::registry::Registry;
use crate::{Error, Result};
use link::LinkKey;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Predicate used to narrow host listings
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostFilter {
    Name(String),
    Device(String),
    Id(String),
}

impl HostFilter {
    pub fn matches(&self, host: &Host) -> bool {
        match self {
            HostFilter::Name(name) => host.name() == name,
            HostFilter::Device(device) => host.device() == device,
            HostFilter::Id(id) => host.id() == id,
        }
    }
}

pub struct Topology {
    id: Uuid,
    registry: Arc<Registry>,
    pool: Arc<PortPool>,
    hosts: RwLock<Vec<Arc<Host>>>,
}

/// Ports of one host as listed at the start of a discovery pass
type PortCache = Vec<(Arc<Host>, Vec<Port>)>;

impl Topology {
    pub fn new(registry: Arc<Registry>, pool: Arc<PortPool>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            pool,
            hosts: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Snapshot of the host list
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().clone()
    }

    pub fn host(&self, id: &str) -> Result<Arc<Host>> {
        self.hosts
            .read()
            .iter()
            .find(|h| h.id() == id)
            .cloned()
            .ok_or_else(|| Error::HostNotFound(id.to_string()))
    }

    pub fn hosts_filtered(&self, filters: &[HostFilter]) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .iter()
            .filter(|h| filters.iter().all(|f| f.matches(h)))
            .cloned()
            .collect()
    }

    /// Create a node of `device` and add it as a new host
    pub async fn new_host(
        &self,
        device: &str,
        name: &str,
        labels: Labels,
        config: &Properties,
    ) -> Result<Arc<Host>> {
        let manager = self.registry.get(device)?;
        let node = manager.add(name, labels.clone(), config).await?;
        let friendly = node.name().await.unwrap_or_else(|_| name.to_string());

        let host = Arc::new(Host::new(friendly, labels, node));
        self.hosts.write().push(host.clone());
        info!("Added host {} ({}, {})", host.name(), host.device(), host.id());
        Ok(host)
    }

    /// Wrap an existing node as a new host
    pub async fn new_host_from_node(&self, node: Arc<dyn Node>) -> Result<Arc<Host>> {
        let name = node.name().await?;
        let host = Arc::new(Host::new(name, Labels::new(), node));
        self.hosts.write().push(host.clone());
        debug!("Added host {} from existing {} node", host.name(), host.device());
        Ok(host)
    }

    /// Remove the host's node through its manager, then drop the host. On
    /// failure the host stays listed.
    pub async fn remove_host(&self, host: &Host) -> Result<()> {
        let manager = self.registry.get(host.device())?;
        manager.remove(host.node().as_ref()).await?;

        self.hosts.write().retain(|h| h.id() != host.id());
        info!("Removed host {} ({})", host.name(), host.id());
        Ok(())
    }

    /// Rebuild the host list from every set-up manager. All previous host
    /// ids and labels are dropped. Returns the number of hosts loaded.
    pub async fn load(&self) -> Result<usize> {
        let mut hosts = Vec::new();
        for manager in self.registry.managers() {
            let nodes = match manager.nodes(&[]).await {
                Ok(nodes) => nodes,
                Err(Error::NotSetUp(device)) => {
                    warn!("Skipping device '{}': manager not set up", device);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for node in nodes {
                let name = node.name().await.unwrap_or_else(|_| node.id());
                hosts.push(Arc::new(Host::new(name, Labels::new(), node)));
            }
        }

        let count = hosts.len();
        *self.hosts.write() = hosts;
        info!("Loaded topology {} with {} hosts", self.id, count);
        Ok(count)
    }

    /// Connect two hosts with a fresh veth pair from the pool.
    ///
    /// A failure part way is not rolled back; [`LinkFailure`] tells which
    /// step failed and carries both port handles.
    pub async fn link(
        &self,
        host: &Arc<Host>,
        peer: &Arc<Host>,
    ) -> std::result::Result<Link, LinkFailure> {
        let (left, right) = self
            .pool
            .create_port_pair()
            .await
            .map_err(|e| LinkFailure::new(LinkStage::Allocate, None, e))?;

        let attached = host
            .node()
            .port_add(&left)
            .await
            .map_err(|e| {
                LinkFailure::new(LinkStage::SelfAttach, Some((left.clone(), right.clone())), e)
            })?;

        let peer_attached = peer
            .node()
            .port_add(&right)
            .await
            .map_err(|e| {
                LinkFailure::new(LinkStage::PeerAttach, Some((attached.clone(), right.clone())), e)
            })?;

        // Peer moves may renumber; read the local end again
        let fabric = self.pool.fabric().as_ref();
        let attached = port::resolve(fabric, &host.netns(), &attached)
            .await
            .unwrap_or(attached);

        let link = Link::new(
            LinkEnd::new(host.clone(), attached),
            LinkEnd::new(peer.clone(), peer_attached),
        );
        info!("Linked {}", link);
        Ok(link)
    }

    /// Tear down every link between two hosts: both ends go back to the pool
    /// and the pair is destroyed. Returns the number of links removed.
    pub async fn unlink(&self, host: &Arc<Host>, peer: &Arc<Host>) -> Result<usize> {
        let links: Vec<Link> = self
            .host_links(host)
            .await?
            .into_iter()
            .filter(|l| l.peer().host().id() == peer.id())
            .collect();

        for link in &links {
            host.node().port_remove(link.local().port()).await?;
            peer.node().port_remove(link.peer().port()).await?;
            self.pool.destroy_port_pair(link.local().port()).await?;
            info!("Unlinked {}", link);
        }
        Ok(links.len())
    }

    async fn port_cache(hosts: &[Arc<Host>]) -> PortCache {
        let mut cache = Vec::with_capacity(hosts.len());
        for host in hosts {
            match host.node().ports().await {
                Ok(ports) => cache.push((host.clone(), ports)),
                Err(e) => debug!("Skipping ports of host {}: {}", host.id(), e),
            }
        }
        cache
    }

    /// Links from `host` to other hosts in `cache`
    fn match_links(host: &Arc<Host>, ports: &[Port], cache: &PortCache) -> Vec<Link> {
        let mut links = Vec::new();
        for port in ports.iter().filter(|p| p.is_veth()) {
            let Some(peer_index) = port.peer_index else {
                continue;
            };
            for (other, other_ports) in cache {
                if other.id() == host.id() {
                    continue;
                }
                let found = other_ports
                    .iter()
                    .find(|pp| pp.index == peer_index && pp.peer_index == Some(port.index));
                if let Some(peer_port) = found {
                    links.push(Link::new(
                        LinkEnd::new(host.clone(), port.clone()),
                        LinkEnd::new(other.clone(), peer_port.clone()),
                    ));
                }
            }
        }
        links
    }

    /// Links with `host` on the local side
    pub async fn host_links(&self, host: &Arc<Host>) -> Result<Vec<Link>> {
        let ports = host.node().ports().await?;
        let others: Vec<Arc<Host>> = self
            .hosts()
            .into_iter()
            .filter(|h| h.id() != host.id())
            .collect();
        let cache = Self::port_cache(&others).await;
        Ok(Self::match_links(host, &ports, &cache))
    }

    /// Every link in the topology, each veth pair reported once. Hosts whose
    /// ports can not be listed are left out.
    pub async fn links(&self) -> Result<Vec<Link>> {
        let cache = Self::port_cache(&self.hosts()).await;

        let mut seen: HashSet<LinkKey> = HashSet::new();
        let mut links = Vec::new();
        for (host, ports) in &cache {
            for link in Self::match_links(host, ports, &cache) {
                if seen.insert(link.key()) {
                    links.push(link);
                }
            }
        }
        Ok(links)
    }

    /// Assign an IPv4 CIDR to a port of `host`
    pub async fn add_address(&self, host: &Host, port: &Port, cidr: &str) -> Result<()> {
        port::add_address(self.pool.fabric().as_ref(), &host.netns(), port, cidr).await
    }

    pub async fn del_address(&self, host: &Host, port: &Port, cidr: &str) -> Result<()> {
        port::del_address(self.pool.fabric().as_ref(), &host.netns(), port, cidr).await
    }

    pub async fn set_port_up(&self, host: &Host, port: &Port, up: bool) -> Result<()> {
        let fabric = self.pool.fabric().as_ref();
        if up {
            port::set_up(fabric, &host.netns(), port).await
        } else {
            port::set_down(fabric, &host.netns(), port).await
        }
    }

    /// Impair one port end of `host`
    pub async fn set_netem(&self, host: &Host, port: &Port, config: &NetemConfig) -> Result<()> {
        netem::apply(self.pool.fabric().as_ref(), &host.netns(), port, config).await
    }

    /// Impair both ends of `link`
    pub async fn set_link_netem(&self, link: &Link, config: &NetemConfig) -> Result<()> {
        link.set_netem(self.pool.fabric().as_ref(), config).await
    }
}
