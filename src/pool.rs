//! Port pool: a namespace holding idle veth ends
//!
//! Fresh veth pairs are created inside the pool namespace, handed out to node
//! namespaces with [`PortPool::take_port`] and returned with
//! [`PortPool::give_port`]. Every mutation holds one async mutex for its whole
//! duration so that [`PortPool::clear`] never races a concurrent
//! [`PortPool::create_port_pair`].

use crate::config::PoolConfig;
use crate::fabric::Fabric;
use crate::netns::NetNs;
use crate::port::{self, Port, PortError, PortFilter};
use crate::Result;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Prefix of every generated pool port name
pub const PORT_NAME_PREFIX: &str = "vp";

const NAME_SUFFIX_LEN: usize = 5;
const NAME_ATTEMPTS: usize = 16;
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random `vp?????` name
fn random_port_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .filter_map(|_| NAME_ALPHABET.choose(&mut rng).map(|b| *b as char))
        .collect();
    format!("{}{}", PORT_NAME_PREFIX, suffix)
}

type NameSource = Box<dyn Fn() -> String + Send + Sync>;

pub struct PortPool {
    fabric: Arc<dyn Fabric>,
    netns: NetNs,
    names: NameSource,
    lock: Mutex<()>,
}

impl PortPool {
    pub fn new(fabric: Arc<dyn Fabric>, config: &PoolConfig) -> Self {
        Self {
            fabric,
            netns: NetNs::named_at(&config.dir, &config.name),
            names: Box::new(random_port_name),
            lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn with_names(mut self, names: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.names = Box::new(names);
        self
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    /// The pool namespace, created on first use
    pub async fn net_ns(&self) -> Result<NetNs> {
        let _guard = self.lock.lock().await;
        self.ensure_netns().await
    }

    /// Caller holds `lock`
    async fn ensure_netns(&self) -> Result<NetNs> {
        if self.fabric.create_netns(&self.netns).await? {
            info!("Created port pool namespace {}", self.netns);
        }
        Ok(self.netns.clone())
    }

    async fn unused_name(&self, netns: &NetNs, taken: Option<&str>) -> Result<String> {
        for _ in 0..NAME_ATTEMPTS {
            let name = (self.names)();
            if Some(name.as_str()) == taken {
                continue;
            }
            if self.fabric.port_by_name(netns, &name).await?.is_none() {
                return Ok(name);
            }
            debug!("Generated port name {} already in use, retrying", name);
        }
        Err(PortError::NamesExhausted(NAME_ATTEMPTS).into())
    }

    /// Create a veth pair inside the pool; both ends or nothing
    pub async fn create_port_pair(&self) -> Result<(Port, Port)> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;

        let name = self.unused_name(&netns, None).await?;
        let peer = self.unused_name(&netns, Some(&name)).await?;

        let pair = self.fabric.create_veth(&netns, &name, &peer).await?;
        info!("Created port pair {} <-> {}", pair.0.name, pair.1.name);
        Ok(pair)
    }

    /// Move `port` from the pool into `target`, returning it as seen there
    pub async fn take_port(&self, target: &NetNs, port: &Port) -> Result<Port> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;

        let resident = port::resolve(self.fabric.as_ref(), &netns, port).await?;
        self.fabric.move_port(&netns, resident.index, target).await?;
        debug!("Took port {} into {}", resident.name, target);

        port::resolve(self.fabric.as_ref(), target, &resident).await
    }

    /// Move `port` from `source` back into the pool
    pub async fn give_port(&self, source: &NetNs, port: &Port) -> Result<Port> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;

        let resident = port::resolve(self.fabric.as_ref(), source, port).await?;
        self.fabric.move_port(source, resident.index, &netns).await?;
        debug!("Gave port {} back from {}", resident.name, source);

        port::resolve(self.fabric.as_ref(), &netns, &resident).await
    }

    /// Delete a pool port. The veth peer goes with it, so neither end stays
    /// valid afterwards.
    pub async fn destroy_port_pair(&self, port: &Port) -> Result<()> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;

        let resident = port::resolve(self.fabric.as_ref(), &netns, port).await?;
        self.fabric.delete_port(&netns, resident.index).await?;
        info!("Destroyed port pair of {}", resident.name);
        Ok(())
    }

    async fn idle_ports(&self, netns: &NetNs, filters: &[PortFilter]) -> Result<Vec<Port>> {
        let ports = self
            .fabric
            .ports(netns)
            .await?
            .into_iter()
            .filter(|p| p.is_veth() && !p.is_loopback())
            .collect();
        Ok(port::apply_filters(ports, filters))
    }

    /// Veth ends currently idle in the pool
    pub async fn ports(&self, filters: &[PortFilter]) -> Result<Vec<Port>> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;
        self.idle_ports(&netns, filters).await
    }

    /// Destroy pool pairs until none is left; returns the number destroyed
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let netns = self.ensure_netns().await?;

        let mut destroyed = 0;
        loop {
            let ports = self.idle_ports(&netns, &[]).await?;
            let Some(first) = ports.first() else {
                break;
            };
            self.fabric.delete_port(&netns, first.index).await?;
            destroyed += 1;
        }

        info!("Cleared port pool ({} pairs destroyed)", destroyed);
        Ok(destroyed)
    }
}
