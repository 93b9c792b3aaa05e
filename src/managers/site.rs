//! Sites: isolated network environments backed by named namespaces

use super::{port_stats, wait_running};
use crate::config::decode;
use crate::fabric::Fabric;
use crate::netns::NetNs;
use crate::node::{self, Labels, Manager, Node, NodeFilter, Properties};
use crate::pool::PortPool;
use crate::port::{self, Port};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const SITE_DEVICE: &str = "site";

/// Setup keys of the site manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Directory holding the site namespace files
    pub dir: PathBuf,
    /// Prepended to site names to form namespace names
    pub prefix: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/sitelink/sites"),
            prefix: "site-".to_string(),
        }
    }
}

#[derive(Default)]
struct SiteState {
    config: Option<SiteConfig>,
    /// Labels by namespace name
    labels: HashMap<String, Labels>,
}

impl SiteState {
    fn config(&self) -> Result<&SiteConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::NotSetUp(SITE_DEVICE.to_string()))
    }
}

struct Shared {
    fabric: Arc<dyn Fabric>,
    pool: Arc<PortPool>,
    state: RwLock<SiteState>,
}

pub struct SiteManager {
    shared: Arc<Shared>,
}

impl SiteManager {
    pub fn new(fabric: Arc<dyn Fabric>, pool: Arc<PortPool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                fabric,
                pool,
                state: RwLock::new(SiteState::default()),
            }),
        }
    }

    fn node(&self, netns: NetNs, prefix: &str) -> Arc<dyn Node> {
        let name = netns
            .name()
            .strip_prefix(prefix)
            .map(str::to_string)
            .unwrap_or_else(|| netns.name());
        Arc::new(SiteNode {
            shared: self.shared.clone(),
            netns,
            name,
        })
    }
}

#[async_trait]
impl Manager for SiteManager {
    fn device(&self) -> &str {
        SITE_DEVICE
    }

    async fn setup(&self, config: &Properties) -> Result<()> {
        let config: SiteConfig = decode(config)?;
        let mut state = self.shared.state.write().await;
        info!(
            "Site manager ready (dir={}, prefix={})",
            config.dir.display(),
            config.prefix
        );
        state.config = Some(config);
        Ok(())
    }

    async fn info(&self) -> Result<Properties> {
        let state = self.shared.state.read().await;
        let config = state.config()?;
        let sites = self.shared.fabric.list_netns(&config.dir, &config.prefix).await?;

        let mut props = Properties::new();
        props.insert("device".into(), json!(SITE_DEVICE));
        props.insert("dir".into(), json!(config.dir));
        props.insert("prefix".into(), json!(config.prefix));
        props.insert("sites".into(), json!(sites.len()));
        Ok(props)
    }

    fn icon(&self) -> &str {
        "docker"
    }

    fn color(&self) -> &str {
        "RoyalBlue"
    }

    async fn nodes(&self, filters: &[NodeFilter]) -> Result<Vec<Arc<dyn Node>>> {
        let state = self.shared.state.read().await;
        let config = state.config()?;

        let nodes = self
            .shared
            .fabric
            .list_netns(&config.dir, &config.prefix)
            .await?
            .into_iter()
            .map(|netns| self.node(netns, &config.prefix))
            .collect();
        Ok(node::apply_filters(nodes, filters).await)
    }

    async fn add(&self, name: &str, labels: Labels, _config: &Properties) -> Result<Arc<dyn Node>> {
        if name.is_empty() {
            return Err(Error::Node("site name must not be empty".to_string()));
        }

        let mut state = self.shared.state.write().await;
        let config = state.config()?.clone();
        let ns_name = format!("{}{}", config.prefix, name);
        if ns_name.contains('/') {
            return Err(Error::Node(format!("invalid site name '{}'", name)));
        }

        let netns = NetNs::named_at(&config.dir, &ns_name);
        if !self.shared.fabric.create_netns(&netns).await? {
            return Err(Error::Node(format!("site '{}' already exists", name)));
        }
        state.labels.insert(ns_name, labels);

        info!("Created site {} ({})", name, netns);
        Ok(self.node(netns, &config.prefix))
    }

    async fn remove(&self, node: &dyn Node) -> Result<()> {
        if node.device() != SITE_DEVICE {
            return Err(Error::Node(format!(
                "{} {} is not a site",
                node.device(),
                node.id()
            )));
        }

        let mut state = self.shared.state.write().await;
        state.config()?;
        let netns = node.netns();
        if !self.shared.fabric.netns_exists(&netns).await {
            return Err(Error::NodeNotFound(node.id()));
        }

        // Veth ends inside die with the namespace, taking their peers along
        self.shared.fabric.remove_netns(&netns).await?;
        state.labels.remove(&netns.name());

        info!("Removed site {}", node.id());
        Ok(())
    }
}

/// One site namespace
pub struct SiteNode {
    shared: Arc<Shared>,
    netns: NetNs,
    name: String,
}

impl SiteNode {
    async fn loopback(&self) -> Result<Option<Port>> {
        self.shared.fabric.port_by_name(&self.netns, "lo").await
    }

    async fn ensure_exists(&self) -> Result<()> {
        if self.shared.fabric.netns_exists(&self.netns).await {
            Ok(())
        } else {
            Err(Error::NodeNotFound(self.id()))
        }
    }

    async fn set_running(&self, up: bool) -> Result<()> {
        let _state = self.shared.state.read().await;
        self.ensure_exists().await?;
        if self.running().await == up {
            return Ok(());
        }

        let lo = self
            .loopback()
            .await?
            .ok_or_else(|| Error::Node(format!("site {} has no loopback", self.name)))?;
        self.shared
            .fabric
            .set_port_up(&self.netns, lo.index, up)
            .await?;
        wait_running(self, up).await?;

        info!("Site {} {}", self.name, if up { "started" } else { "stopped" });
        Ok(())
    }
}

#[async_trait]
impl Node for SiteNode {
    fn id(&self) -> String {
        self.netns.name()
    }

    async fn name(&self) -> Result<String> {
        self.ensure_exists().await?;
        Ok(self.name.clone())
    }

    fn device(&self) -> &str {
        SITE_DEVICE
    }

    async fn start(&self) -> Result<()> {
        self.set_running(true).await
    }

    async fn stop(&self) -> Result<()> {
        self.set_running(false).await
    }

    async fn running(&self) -> bool {
        matches!(self.loopback().await, Ok(Some(lo)) if lo.up)
    }

    async fn info(&self) -> Result<Properties> {
        let state = self.shared.state.read().await;
        self.ensure_exists().await?;
        let ports = self.ports().await?;

        let mut props = Properties::new();
        props.insert("id".into(), json!(self.id()));
        props.insert("name".into(), json!(self.name));
        props.insert("netns".into(), json!(self.netns.path()));
        props.insert("running".into(), json!(self.running().await));
        props.insert(
            "ports".into(),
            json!(ports.iter().map(|p| p.name.clone()).collect::<Vec<_>>()),
        );
        props.insert(
            "labels".into(),
            json!(state.labels.get(&self.netns.name()).cloned().unwrap_or_default()),
        );
        Ok(props)
    }

    fn netns(&self) -> NetNs {
        self.netns.clone()
    }

    async fn ports(&self) -> Result<Vec<Port>> {
        Ok(self
            .shared
            .fabric
            .ports(&self.netns)
            .await?
            .into_iter()
            .filter(|p| p.is_veth())
            .collect())
    }

    async fn port_add(&self, port: &Port) -> Result<Port> {
        let _state = self.shared.state.read().await;
        self.ensure_exists().await?;

        let taken = self.shared.pool.take_port(&self.netns, port).await?;
        port::set_up(self.shared.fabric.as_ref(), &self.netns, &taken).await?;
        debug!("Attached {} to site {}", taken.name, self.name);

        port::resolve(self.shared.fabric.as_ref(), &self.netns, &taken).await
    }

    async fn port_remove(&self, port: &Port) -> Result<()> {
        let _state = self.shared.state.read().await;
        self.shared.pool.give_port(&self.netns, port).await?;
        debug!("Detached {} from site {}", port.name, self.name);
        Ok(())
    }

    async fn stats(&self) -> Result<Properties> {
        self.ensure_exists().await?;
        Ok(port_stats(&self.ports().await?))
    }
}
