//! Switches: Linux bridges living in one working namespace

use super::{port_stats, wait_running};
use crate::config::decode;
use crate::fabric::Fabric;
use crate::netns::NetNs;
use crate::node::{self, Labels, Manager, Node, NodeFilter, Properties};
use crate::pool::PortPool;
use crate::port::{self, Port, PortError, PortKind};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const SWITCH_DEVICE: &str = "switch";

/// Setup keys of the switch manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Namespace file the bridges live in; the process namespace when unset
    pub netns: Option<PathBuf>,
    /// Prepended to switch names to form bridge names. Only bridges carrying
    /// it are managed, so it must not be empty.
    pub prefix: String,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            netns: None,
            prefix: "sl-".to_string(),
        }
    }
}

/// Add-time keys
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct SwitchOptions {
    mtu: Option<u32>,
}

struct SwitchState {
    netns: NetNs,
    prefix: String,
    /// Labels by bridge index
    labels: HashMap<u32, Labels>,
}

struct Shared {
    fabric: Arc<dyn Fabric>,
    pool: Arc<PortPool>,
    state: RwLock<Option<SwitchState>>,
}

impl Shared {
    fn not_set_up() -> Error {
        Error::NotSetUp(SWITCH_DEVICE.to_string())
    }
}

impl SwitchState {
    /// Bridges created under our prefix; everything else on the namespace
    /// belongs to someone else
    fn owns(&self, port: &Port) -> bool {
        port.kind == PortKind::Bridge
            && port.name.len() > self.prefix.len()
            && port.name.starts_with(&self.prefix)
    }
}

pub struct SwitchManager {
    shared: Arc<Shared>,
}

impl SwitchManager {
    pub fn new(fabric: Arc<dyn Fabric>, pool: Arc<PortPool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                fabric,
                pool,
                state: RwLock::new(None),
            }),
        }
    }

    fn node(&self, state: &SwitchState, bridge: &Port) -> Arc<dyn Node> {
        Arc::new(SwitchNode {
            shared: self.shared.clone(),
            netns: state.netns.clone(),
            prefix: state.prefix.clone(),
            index: bridge.index,
        })
    }

    async fn bridges(&self, state: &SwitchState) -> Result<Vec<Port>> {
        Ok(self
            .shared
            .fabric
            .ports(&state.netns)
            .await?
            .into_iter()
            .filter(|p| state.owns(p))
            .collect())
    }
}

#[async_trait]
impl Manager for SwitchManager {
    fn device(&self) -> &str {
        SWITCH_DEVICE
    }

    async fn setup(&self, config: &Properties) -> Result<()> {
        let config: SwitchConfig = decode(config)?;
        if config.prefix.is_empty() {
            return Err(Error::InvalidConfig(
                "switch prefix must not be empty".to_string(),
            ));
        }
        let netns = match &config.netns {
            Some(path) => NetNs::from_path(path),
            None => NetNs::current(),
        };
        if !self.shared.fabric.netns_exists(&netns).await {
            return Err(Error::InvalidConfig(format!(
                "switch namespace {} does not exist",
                netns
            )));
        }

        let mut state = self.shared.state.write().await;
        let labels = state.take().map(|s| s.labels).unwrap_or_default();
        info!(
            "Switch manager ready (netns={}, prefix='{}')",
            netns, config.prefix
        );
        *state = Some(SwitchState {
            netns,
            prefix: config.prefix,
            labels,
        });
        Ok(())
    }

    async fn info(&self) -> Result<Properties> {
        let guard = self.shared.state.read().await;
        let state = guard.as_ref().ok_or_else(Shared::not_set_up)?;
        let bridges = self.bridges(state).await?;

        let mut props = Properties::new();
        props.insert("device".into(), json!(SWITCH_DEVICE));
        props.insert("netns".into(), json!(state.netns.path()));
        props.insert("prefix".into(), json!(state.prefix));
        props.insert("switches".into(), json!(bridges.len()));
        Ok(props)
    }

    fn icon(&self) -> &str {
        "gf-glue"
    }

    fn color(&self) -> &str {
        "LightSalmon"
    }

    async fn nodes(&self, filters: &[NodeFilter]) -> Result<Vec<Arc<dyn Node>>> {
        let guard = self.shared.state.read().await;
        let state = guard.as_ref().ok_or_else(Shared::not_set_up)?;

        let nodes = self
            .bridges(state)
            .await?
            .iter()
            .map(|bridge| self.node(state, bridge))
            .collect();
        Ok(node::apply_filters(nodes, filters).await)
    }

    async fn add(&self, name: &str, labels: Labels, config: &Properties) -> Result<Arc<dyn Node>> {
        if name.is_empty() {
            return Err(Error::Node("switch name must not be empty".to_string()));
        }
        let options: SwitchOptions = decode(config)?;

        let mut guard = self.shared.state.write().await;
        let state = guard.as_mut().ok_or_else(Shared::not_set_up)?;

        let bridge_name = format!("{}{}", state.prefix, name);
        if !port::is_valid_interface_name(&bridge_name) {
            return Err(PortError::InvalidName(bridge_name).into());
        }

        let fabric = &self.shared.fabric;
        let bridge = fabric.create_bridge(&state.netns, &bridge_name).await?;
        if let Some(mtu) = options.mtu {
            fabric.set_mtu(&state.netns, bridge.index, mtu).await?;
        }
        state.labels.insert(bridge.index, labels);

        info!("Created switch {} (index {})", bridge_name, bridge.index);
        Ok(self.node(state, &bridge))
    }

    async fn remove(&self, node: &dyn Node) -> Result<()> {
        if node.device() != SWITCH_DEVICE {
            return Err(Error::Node(format!(
                "{} {} is not a switch",
                node.device(),
                node.id()
            )));
        }

        let mut guard = self.shared.state.write().await;
        let state = guard.as_mut().ok_or_else(Shared::not_set_up)?;
        let index: u32 = node
            .id()
            .parse()
            .map_err(|_| Error::NodeNotFound(node.id()))?;

        let fabric = &self.shared.fabric;
        let bridge = fabric
            .port_by_index(&state.netns, index)
            .await?
            .filter(|p| state.owns(p))
            .ok_or_else(|| Error::NodeNotFound(node.id()))?;

        // Wires plugged into the switch go with it, peers included
        let attached = fabric.ports(&state.netns).await?;
        for port in port::apply_filters(attached, &[port::PortFilter::Controller(index)]) {
            if let Err(e) = fabric.delete_port(&state.netns, port.index).await {
                warn!("Failed to delete {} of switch {}: {}", port.name, bridge.name, e);
            }
        }

        fabric.delete_port(&state.netns, index).await?;
        state.labels.remove(&index);

        info!("Removed switch {}", bridge.name);
        Ok(())
    }
}

/// One bridge, identified by its link index
pub struct SwitchNode {
    shared: Arc<Shared>,
    netns: NetNs,
    prefix: String,
    index: u32,
}

impl SwitchNode {
    async fn bridge(&self) -> Result<Port> {
        self.shared
            .fabric
            .port_by_index(&self.netns, self.index)
            .await?
            .filter(|p| p.kind == PortKind::Bridge)
            .ok_or_else(|| Error::NodeNotFound(self.id()))
    }

    async fn set_running(&self, up: bool) -> Result<()> {
        let _state = self.shared.state.read().await;
        let bridge = self.bridge().await?;
        if bridge.up == up {
            return Ok(());
        }

        self.shared
            .fabric
            .set_port_up(&self.netns, self.index, up)
            .await?;
        wait_running(self, up).await?;

        info!("Switch {} {}", bridge.name, if up { "started" } else { "stopped" });
        Ok(())
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn id(&self) -> String {
        self.index.to_string()
    }

    async fn name(&self) -> Result<String> {
        let bridge = self.bridge().await?;
        Ok(bridge
            .name
            .strip_prefix(&self.prefix)
            .map(str::to_string)
            .unwrap_or(bridge.name))
    }

    fn device(&self) -> &str {
        SWITCH_DEVICE
    }

    async fn start(&self) -> Result<()> {
        self.set_running(true).await
    }

    async fn stop(&self) -> Result<()> {
        self.set_running(false).await
    }

    async fn running(&self) -> bool {
        matches!(self.bridge().await, Ok(bridge) if bridge.up)
    }

    async fn info(&self) -> Result<Properties> {
        let guard = self.shared.state.read().await;
        let bridge = self.bridge().await?;
        let ports = self.ports().await?;
        let labels = guard
            .as_ref()
            .and_then(|s| s.labels.get(&self.index).cloned())
            .unwrap_or_default();

        let mut props = Properties::new();
        props.insert("id".into(), json!(self.id()));
        props.insert("name".into(), json!(self.name().await?));
        props.insert("bridge".into(), json!(bridge.name));
        props.insert("netns".into(), json!(self.netns.path()));
        props.insert("running".into(), json!(bridge.up));
        props.insert("mtu".into(), json!(bridge.mtu));
        props.insert("hw_addr".into(), json!(bridge.hw_addr));
        props.insert(
            "ports".into(),
            json!(ports.iter().map(|p| p.name.clone()).collect::<Vec<_>>()),
        );
        props.insert("labels".into(), json!(labels));
        Ok(props)
    }

    fn netns(&self) -> NetNs {
        self.netns.clone()
    }

    async fn ports(&self) -> Result<Vec<Port>> {
        let ports = self.shared.fabric.ports(&self.netns).await?;
        Ok(port::apply_filters(
            ports,
            &[
                port::PortFilter::KindIn(vec![PortKind::Veth]),
                port::PortFilter::Controller(self.index),
            ],
        ))
    }

    async fn port_add(&self, port: &Port) -> Result<Port> {
        let _state = self.shared.state.read().await;
        let bridge = self.bridge().await?;

        let fabric = self.shared.fabric.as_ref();
        let taken = self.shared.pool.take_port(&self.netns, port).await?;
        fabric
            .set_controller(&self.netns, taken.index, Some(bridge.index))
            .await?;
        port::set_up(fabric, &self.netns, &taken).await?;
        debug!("Attached {} to switch {}", taken.name, bridge.name);

        port::resolve(fabric, &self.netns, &taken).await
    }

    async fn port_remove(&self, port: &Port) -> Result<()> {
        let _state = self.shared.state.read().await;
        let fabric = self.shared.fabric.as_ref();

        let resident = port::resolve(fabric, &self.netns, port).await?;
        if resident.controller == Some(self.index) {
            fabric
                .set_controller(&self.netns, resident.index, None)
                .await?;
        }
        self.shared.pool.give_port(&self.netns, &resident).await?;
        debug!("Detached {} from switch {}", resident.name, self.index);
        Ok(())
    }

    async fn stats(&self) -> Result<Properties> {
        let bridge = self.bridge().await?;
        Ok(port_stats(std::slice::from_ref(&bridge)))
    }
}
