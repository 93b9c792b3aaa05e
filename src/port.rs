//! Ports: snapshots of kernel network interfaces
//!
//! A [`Port`] is what a [`Fabric`] reports for one link in one namespace at
//! the moment of the query. Indexes are namespace-local and may change when a
//! port migrates, so operations resolve ports by name in the namespace they
//! are applied to.

use crate::fabric::Fabric;
use crate::netns::NetNs;
use crate::node::Properties;
use crate::Result;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Port '{name}' not found in {netns}")]
    NotFound { name: String, netns: String },

    #[error("Port with index {index} not found in {netns}")]
    IndexNotFound { index: u32, netns: String },

    #[error("Port '{0}' already exists")]
    AlreadyExists(String),

    #[error("Failed to create veth pair {0}")]
    CreateFailed(String),

    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    #[error("Invalid IPv4 CIDR '{0}'")]
    InvalidAddress(String),

    #[error("Invalid hardware address '{0}'")]
    InvalidHwAddr(String),

    #[error("Address {address} not present on {port}")]
    AddressNotFound { address: String, port: String },

    #[error("Could not find a free port name after {0} attempts")]
    NamesExhausted(usize),

    #[error("Traffic control command failed: {0}")]
    Command(String),
}

/// Link type as reported by the kernel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Veth,
    Bridge,
    Loopback,
    #[default]
    Other,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PortKind::Veth => "veth",
            PortKind::Bridge => "bridge",
            PortKind::Loopback => "loopback",
            PortKind::Other => "other",
        };
        f.write_str(kind)
    }
}

/// Interface I/O counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub collisions: u64,
}

impl PortStats {
    pub fn accumulate(&mut self, other: &PortStats) {
        self.rx_bytes += other.rx_bytes;
        self.rx_packets += other.rx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_packets += other.tx_packets;
        self.rx_dropped += other.rx_dropped;
        self.tx_dropped += other.tx_dropped;
        self.rx_errors += other.rx_errors;
        self.tx_errors += other.tx_errors;
        self.collisions += other.collisions;
    }

    /// Counter map in the shape node stats are reported in
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("mainstat".into(), json!(self.tx_bytes as f64));
        props.insert("secondarystat".into(), json!(self.rx_bytes as f64));
        props.insert("rx_bytes".into(), json!(self.rx_bytes));
        props.insert("rx_packets".into(), json!(self.rx_packets));
        props.insert("tx_bytes".into(), json!(self.tx_bytes));
        props.insert("tx_packets".into(), json!(self.tx_packets));
        props.insert("rx_dropped".into(), json!(self.rx_dropped));
        props.insert("tx_dropped".into(), json!(self.tx_dropped));
        props.insert("rx_errors".into(), json!(self.rx_errors));
        props.insert("tx_errors".into(), json!(self.tx_errors));
        props.insert("collisions".into(), json!(self.collisions));
        props
    }
}

/// Snapshot of one interface in one namespace
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub index: u32,
    pub kind: PortKind,
    pub hw_addr: String,
    pub mtu: u32,
    /// Administratively up
    pub up: bool,
    /// Index of the veth peer, in the peer's namespace
    pub peer_index: Option<u32>,
    /// Index of the bridge this port is enslaved to
    pub controller: Option<u32>,
    pub stats: PortStats,
}

impl Port {
    pub fn is_veth(&self) -> bool {
        self.kind == PortKind::Veth
    }

    pub fn is_loopback(&self) -> bool {
        self.kind == PortKind::Loopback || self.name == "lo"
    }
}

/// Predicate used to narrow a port listing
#[derive(Clone, Debug, PartialEq)]
pub enum PortFilter {
    /// Keep ports whose name is one of the given names
    NameIn(Vec<String>),
    /// Keep ports whose kind is one of the given kinds
    KindIn(Vec<PortKind>),
    /// Keep ports enslaved to the given bridge index
    Controller(u32),
}

impl PortFilter {
    pub fn matches(&self, port: &Port) -> bool {
        match self {
            PortFilter::NameIn(names) => names.iter().any(|n| *n == port.name),
            PortFilter::KindIn(kinds) => kinds.contains(&port.kind),
            PortFilter::Controller(index) => port.controller == Some(*index),
        }
    }
}

/// Apply filters in order
pub fn apply_filters(ports: Vec<Port>, filters: &[PortFilter]) -> Vec<Port> {
    ports
        .into_iter()
        .filter(|p| filters.iter().all(|f| f.matches(p)))
        .collect()
}

/// Re-read `port` by name inside `netns`
pub async fn resolve(fabric: &dyn Fabric, netns: &NetNs, port: &Port) -> Result<Port> {
    fabric
        .port_by_name(netns, &port.name)
        .await?
        .ok_or_else(|| {
            PortError::NotFound {
                name: port.name.clone(),
                netns: netns.to_string(),
            }
            .into()
        })
}

pub async fn set_up(fabric: &dyn Fabric, netns: &NetNs, port: &Port) -> Result<()> {
    let port = resolve(fabric, netns, port).await?;
    fabric.set_port_up(netns, port.index, true).await
}

pub async fn set_down(fabric: &dyn Fabric, netns: &NetNs, port: &Port) -> Result<()> {
    let port = resolve(fabric, netns, port).await?;
    fabric.set_port_up(netns, port.index, false).await
}

pub async fn set_name(fabric: &dyn Fabric, netns: &NetNs, port: &Port, name: &str) -> Result<()> {
    if !is_valid_interface_name(name) {
        return Err(PortError::InvalidName(name.to_string()).into());
    }
    let port = resolve(fabric, netns, port).await?;
    fabric.rename_port(netns, port.index, name).await
}

pub async fn set_hw_addr(fabric: &dyn Fabric, netns: &NetNs, port: &Port, hw: &str) -> Result<()> {
    let mac = parse_mac(hw)?;
    let port = resolve(fabric, netns, port).await?;
    fabric.set_hw_addr(netns, port.index, mac).await
}

/// Assign an IPv4 CIDR (e.g. `192.168.5.5/24`) to the port
pub async fn add_address(fabric: &dyn Fabric, netns: &NetNs, port: &Port, cidr: &str) -> Result<()> {
    let network = parse_cidr(cidr)?;
    let port = resolve(fabric, netns, port).await?;
    debug!("Adding address {} to {} in {}", network, port.name, netns);
    fabric.add_address(netns, port.index, network).await
}

pub async fn del_address(fabric: &dyn Fabric, netns: &NetNs, port: &Port, cidr: &str) -> Result<()> {
    let network = parse_cidr(cidr)?;
    let port = resolve(fabric, netns, port).await?;
    debug!("Removing address {} from {} in {}", network, port.name, netns);
    fabric.del_address(netns, port.index, network).await
}

pub fn parse_cidr(cidr: &str) -> Result<Ipv4Network> {
    cidr.parse::<Ipv4Network>()
        .map_err(|_| PortError::InvalidAddress(cidr.to_string()).into())
}

pub fn parse_mac(hw: &str) -> Result<Vec<u8>> {
    let bytes: Option<Vec<u8>> = hw
        .split(':')
        .map(|octet| {
            if octet.len() == 2 {
                u8::from_str_radix(octet, 16).ok()
            } else {
                None
            }
        })
        .collect();
    match bytes {
        Some(bytes) if bytes.len() == 6 => Ok(bytes),
        _ => Err(PortError::InvalidHwAddr(hw.to_string()).into()),
    }
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Validate interface name according to Linux rules
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('-')
}
