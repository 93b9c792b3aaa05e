//! Network emulation (netem) parameters
//!
//! Latency and jitter are microseconds, loss is a percentage. Nothing is range
//! checked here; the kernel rejects what it does not accept. Parameters apply
//! to one port end in one direction, so a symmetric impairment needs both ends
//! of a link configured.

use crate::fabric::Fabric;
use crate::netns::NetNs;
use crate::port::{self, Port};
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Netem configuration for one port end
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetemConfig {
    /// Base delay in microseconds
    pub latency_us: u32,
    /// Jitter in microseconds
    pub jitter_us: u32,
    /// Loss percentage (0.0-100.0)
    pub loss_percent: f32,
}

impl NetemConfig {
    pub fn new(latency_us: u32, jitter_us: u32, loss_percent: f32) -> Self {
        Self {
            latency_us,
            jitter_us,
            loss_percent,
        }
    }

    /// Arguments for `tc` replacing the root qdisc of `iface` with netem.
    ///
    /// Delay and loss are always present so that applying a zero config
    /// clears a previous impairment.
    pub fn tc_args(&self, iface: &str) -> Vec<String> {
        let mut args: Vec<String> = ["qdisc", "replace", "dev", iface, "root", "netem"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        args.push("delay".into());
        args.push(format!("{}us", self.latency_us));
        if self.jitter_us > 0 {
            args.push(format!("{}us", self.jitter_us));
        }

        args.push("loss".into());
        args.push(format!("{}%", self.loss_percent));
        args
    }
}

/// Apply netem to `port` inside `netns`
pub async fn apply(fabric: &dyn Fabric, netns: &NetNs, port: &Port, config: &NetemConfig) -> Result<()> {
    let port = port::resolve(fabric, netns, port).await?;
    debug!("Applying netem {:?} to {} in {}", config, port.name, netns);
    fabric.set_netem(netns, &port.name, config).await
}
