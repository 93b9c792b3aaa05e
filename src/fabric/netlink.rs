//! rtnetlink-backed fabric
//!
//! Netlink sockets are bound to the namespace of the thread that opens them,
//! so every operation runs on a short-lived OS thread that enters the target
//! namespace, opens its own connection on a single-threaded runtime and
//! reports back over a oneshot channel. Callers on the main runtime never
//! change namespace.

use super::Fabric;
use crate::netem::NetemConfig;
use crate::netns::{NetNs, NetNsError};
use crate::port::{format_mac, Port, PortError, PortKind, PortStats};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    InfoKind, LinkAttribute, LinkFlag, LinkInfo, LinkLayerType, LinkMessage,
};
use nix::errno::Errno;
use rtnetlink::{new_connection, Handle};
use std::future::Future;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Fabric that drives the running kernel
#[derive(Debug, Default, Clone)]
pub struct NetlinkFabric;

impl NetlinkFabric {
    pub fn new() -> Self {
        Self
    }
}

/// The kernel answered EEXIST
fn already_exists(error: &rtnetlink::Error) -> bool {
    matches!(error, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -(Errno::EEXIST as i32))
}

/// Run `op` with a netlink handle opened inside `netns`
async fn run_in<F, Fut, T>(netns: &NetNs, label: &'static str, op: F) -> Result<T>
where
    F: FnOnce(Handle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
    T: Send + 'static,
{
    let netns = netns.clone();
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("nl-{}", label))
        .spawn(move || {
            let result = (|| -> Result<T> {
                let _guard = netns.enter()?;
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(async move {
                    let (connection, handle, _) = new_connection()?;
                    tokio::spawn(connection);
                    op(handle).await
                })
            })();
            let _ = tx.send(result);
        })?;

    rx.await
        .map_err(|_| Error::Node(format!("netlink worker '{}' exited without a result", label)))?
}

async fn list_links(handle: &Handle) -> Result<Vec<Port>> {
    let mut links = handle.link().get().execute();
    let mut ports = Vec::new();
    while let Some(msg) = links.try_next().await? {
        ports.push(port_from_message(msg));
    }
    Ok(ports)
}

async fn find_by_name(handle: &Handle, name: &str) -> Result<Option<Port>> {
    Ok(list_links(handle)
        .await?
        .into_iter()
        .find(|p| p.name == name))
}

fn port_from_message(msg: LinkMessage) -> Port {
    let mut port = Port {
        index: msg.header.index,
        up: msg.header.flags.contains(&LinkFlag::Up),
        ..Default::default()
    };
    let mut link = None;

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => port.name = name,
            LinkAttribute::Address(mac) => port.hw_addr = format_mac(&mac),
            LinkAttribute::Mtu(mtu) => port.mtu = mtu,
            LinkAttribute::Link(index) => link = Some(index),
            LinkAttribute::Controller(index) => port.controller = Some(index),
            LinkAttribute::Stats64(stats) => {
                port.stats = PortStats {
                    rx_bytes: stats.rx_bytes,
                    rx_packets: stats.rx_packets,
                    tx_bytes: stats.tx_bytes,
                    tx_packets: stats.tx_packets,
                    rx_dropped: stats.rx_dropped,
                    tx_dropped: stats.tx_dropped,
                    rx_errors: stats.rx_errors,
                    tx_errors: stats.tx_errors,
                    collisions: stats.collisions,
                }
            }
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        port.kind = match kind {
                            InfoKind::Veth => PortKind::Veth,
                            InfoKind::Bridge => PortKind::Bridge,
                            _ => PortKind::Other,
                        };
                    }
                }
            }
            _ => {}
        }
    }

    if port.kind == PortKind::Other && msg.header.link_layer_type == LinkLayerType::Loopback {
        port.kind = PortKind::Loopback;
    }
    // IFLA_LINK of a veth is its peer's index in the peer's namespace
    if port.kind == PortKind::Veth {
        port.peer_index = link;
    }
    port
}

#[async_trait]
impl Fabric for NetlinkFabric {
    async fn create_netns(&self, netns: &NetNs) -> Result<bool> {
        let netns = netns.clone();
        tokio::task::spawn_blocking(move || netns.create())
            .await
            .map_err(|e| Error::Node(format!("netns create task failed: {}", e)))?
            .map_err(Error::from)
    }

    async fn remove_netns(&self, netns: &NetNs) -> Result<()> {
        let netns = netns.clone();
        tokio::task::spawn_blocking(move || netns.remove())
            .await
            .map_err(|e| Error::Node(format!("netns remove task failed: {}", e)))?
            .map_err(Error::from)
    }

    async fn netns_exists(&self, netns: &NetNs) -> bool {
        netns.exists()
    }

    async fn list_netns(&self, dir: &Path, prefix: &str) -> Result<Vec<NetNs>> {
        Ok(NetNs::list_at(dir, prefix)?)
    }

    async fn ports(&self, netns: &NetNs) -> Result<Vec<Port>> {
        run_in(netns, "links", |handle| async move { list_links(&handle).await }).await
    }

    async fn port_by_name(&self, netns: &NetNs, name: &str) -> Result<Option<Port>> {
        let name = name.to_string();
        run_in(netns, "link-by-name", move |handle| async move {
            find_by_name(&handle, &name).await
        })
        .await
    }

    async fn port_by_index(&self, netns: &NetNs, index: u32) -> Result<Option<Port>> {
        run_in(netns, "link-by-index", move |handle| async move {
            Ok(list_links(&handle)
                .await?
                .into_iter()
                .find(|p| p.index == index))
        })
        .await
    }

    async fn create_veth(&self, netns: &NetNs, name: &str, peer: &str) -> Result<(Port, Port)> {
        debug!("Creating veth pair {} <-> {} in {}", name, peer, netns);

        let (name, peer) = (name.to_string(), peer.to_string());
        let pair = run_in(netns, "veth-add", move |handle| async move {
            handle
                .link()
                .add()
                .veth(name.clone(), peer.clone())
                .execute()
                .await?;

            let left = find_by_name(&handle, &name).await?;
            let right = find_by_name(&handle, &peer).await?;
            match (left, right) {
                (Some(left), Some(right)) => Ok((left, right)),
                (left, right) => {
                    // Never leave half a pair behind
                    if let Some(leftover) = left.or(right) {
                        let _ = handle.link().del(leftover.index).execute().await;
                    }
                    Err(PortError::CreateFailed(format!("{}/{}", name, peer)).into())
                }
            }
        })
        .await?;

        info!("Created veth pair: {} <-> {}", pair.0.name, pair.1.name);
        Ok(pair)
    }

    async fn move_port(&self, from: &NetNs, index: u32, to: &NetNs) -> Result<()> {
        debug!("Moving link {} from {} to {}", index, from, to);

        let target = to.clone();
        run_in(from, "link-setns", move |handle| async move {
            let target = target.open()?;
            handle
                .link()
                .set(index)
                .setns_by_fd(target.as_raw_fd())
                .execute()
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_port(&self, netns: &NetNs, index: u32) -> Result<()> {
        debug!("Deleting link {} in {}", index, netns);
        run_in(netns, "link-del", move |handle| async move {
            handle.link().del(index).execute().await?;
            Ok(())
        })
        .await
    }

    async fn set_port_up(&self, netns: &NetNs, index: u32, up: bool) -> Result<()> {
        run_in(netns, "link-updown", move |handle| async move {
            let request = handle.link().set(index);
            let request = if up { request.up() } else { request.down() };
            request.execute().await?;
            Ok(())
        })
        .await
    }

    async fn rename_port(&self, netns: &NetNs, index: u32, name: &str) -> Result<()> {
        let name = name.to_string();
        run_in(netns, "link-rename", move |handle| async move {
            handle.link().set(index).name(name).execute().await?;
            Ok(())
        })
        .await
    }

    async fn set_hw_addr(&self, netns: &NetNs, index: u32, hw: Vec<u8>) -> Result<()> {
        run_in(netns, "link-hwaddr", move |handle| async move {
            handle.link().set(index).address(hw).execute().await?;
            Ok(())
        })
        .await
    }

    async fn set_mtu(&self, netns: &NetNs, index: u32, mtu: u32) -> Result<()> {
        run_in(netns, "link-mtu", move |handle| async move {
            handle.link().set(index).mtu(mtu).execute().await?;
            Ok(())
        })
        .await
    }

    async fn create_bridge(&self, netns: &NetNs, name: &str) -> Result<Port> {
        debug!("Creating bridge {} in {}", name, netns);

        let name = name.to_string();
        let ns = netns.clone();
        run_in(netns, "bridge-add", move |handle| async move {
            handle.link().add().bridge(name.clone()).execute().await?;
            let bridge = find_by_name(&handle, &name).await?.ok_or_else(|| {
                Error::from(PortError::NotFound {
                    name: name.clone(),
                    netns: ns.to_string(),
                })
            })?;
            // New bridges come up down; make it explicit
            handle.link().set(bridge.index).down().execute().await?;
            Ok(bridge)
        })
        .await
    }

    async fn set_controller(&self, netns: &NetNs, index: u32, controller: Option<u32>) -> Result<()> {
        run_in(netns, "link-controller", move |handle| async move {
            // IFLA_MASTER 0 releases the link from its bridge
            handle
                .link()
                .set(index)
                .controller(controller.unwrap_or(0))
                .execute()
                .await?;
            Ok(())
        })
        .await
    }

    async fn add_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()> {
        run_in(netns, "addr-add", move |handle| async move {
            match handle
                .address()
                .add(index, IpAddr::V4(address.ip()), address.prefix())
                .execute()
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if already_exists(&e) => {
                    debug!("Address {} already present on link {}", address, index);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn del_address(&self, netns: &NetNs, index: u32, address: Ipv4Network) -> Result<()> {
        run_in(netns, "addr-del", move |handle| async move {
            let mut addresses = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            while let Some(msg) = addresses.try_next().await? {
                let matches = msg.header.prefix_len == address.prefix()
                    && msg.attributes.iter().any(|attr| {
                        matches!(attr, AddressAttribute::Address(ip) if *ip == IpAddr::V4(address.ip()))
                    });
                if matches {
                    handle.address().del(msg).execute().await?;
                    return Ok(());
                }
            }
            Err(PortError::AddressNotFound {
                address: address.to_string(),
                port: index.to_string(),
            }
            .into())
        })
        .await
    }

    async fn set_netem(&self, netns: &NetNs, name: &str, config: &NetemConfig) -> Result<()> {
        if !netns.exists() {
            return Err(NetNsError::NotFound(netns.to_string()).into());
        }

        let mut cmd = Command::new("nsenter");
        cmd.arg(format!("--net={}", netns.path().display()))
            .arg("tc")
            .args(config.tc_args(name));

        let output = cmd
            .output()
            .await
            .map_err(|e| PortError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PortError::Command(format!(
                "tc netem failed in {} on {}: {}",
                netns,
                name,
                stderr.trim()
            ))
            .into());
        }

        info!(
            "Netem configured in {} on {} (delay={}us jitter={}us loss={}%)",
            netns, name, config.latency_us, config.jitter_us, config.loss_percent
        );
        Ok(())
    }
}
