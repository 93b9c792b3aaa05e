//! CLI command implementations

use anyhow::{Context, Result};
use serde_json::json;
use sitelink::node::{Labels, Properties};
use sitelink::{
    Config, Fabric, Host, MemoryFabric, NetlinkFabric, PortPool, Registry, Topology,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Wire up fabric, pool, managers and topology from the configuration
pub async fn build_topology(config: &Config, dry_run: bool) -> Result<Topology> {
    let fabric: Arc<dyn Fabric> = if dry_run {
        info!("Dry run: using the in-memory fabric");
        Arc::new(MemoryFabric::new())
    } else {
        Arc::new(NetlinkFabric::new())
    };

    let pool = Arc::new(PortPool::new(fabric.clone(), &config.pool));
    let registry = Arc::new(Registry::with_builtin(fabric, pool.clone()));
    let ready = registry.setup_all(&config.managers).await;
    if ready < registry.devices().len() {
        warn!(
            "{} of {} device managers are not usable",
            registry.devices().len() - ready,
            registry.devices().len()
        );
    }

    Ok(Topology::new(registry, pool))
}

/// Implementation of the 'devices' command
pub async fn cmd_devices(topology: &Topology) -> Result<()> {
    println!("{:<10} {:<10} COLOR", "DEVICE", "ICON");
    for manager in topology.registry().managers() {
        println!(
            "{:<10} {:<10} {}",
            manager.device(),
            manager.icon(),
            manager.color()
        );
    }
    Ok(())
}

/// Implementation of the 'hosts' command
pub async fn cmd_hosts(topology: &Topology, as_json: bool) -> Result<()> {
    topology.load().await.context("loading topology")?;

    let hosts = topology.hosts();
    if as_json {
        let mut rows = Vec::with_capacity(hosts.len());
        for host in &hosts {
            rows.push(json!({
                "id": host.id(),
                "name": host.name(),
                "device": host.device(),
                "node": host.node().id(),
                "state": host.state().await,
                "created_at": host.created_at(),
            }));
        }
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<36} {:<16} {:<8} STATE", "ID", "NAME", "DEVICE");
    for host in &hosts {
        println!(
            "{:<36} {:<16} {:<8} {}",
            host.id(),
            host.name(),
            host.device(),
            host.state().await
        );
    }
    println!("{} hosts", hosts.len());
    Ok(())
}

/// Implementation of the 'links' command
pub async fn cmd_links(topology: &Topology, as_json: bool) -> Result<()> {
    topology.load().await.context("loading topology")?;
    let links = topology.links().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&links)?);
        return Ok(());
    }

    for link in &links {
        println!("{}", link);
    }
    println!("{} links", links.len());
    Ok(())
}

/// Implementation of 'pool list'
pub async fn cmd_pool_list(topology: &Topology) -> Result<()> {
    let ports = topology.pool().ports(&[]).await?;
    println!("{:<10} {:<6} {:<6} PEER", "NAME", "INDEX", "UP");
    for port in &ports {
        println!(
            "{:<10} {:<6} {:<6} {}",
            port.name,
            port.index,
            port.up,
            port.peer_index.map(|i| i.to_string()).unwrap_or_default()
        );
    }
    println!("{} idle ports", ports.len());
    Ok(())
}

/// Implementation of 'pool clear'
pub async fn cmd_pool_clear(topology: &Topology) -> Result<()> {
    let destroyed = topology.pool().clear().await?;
    println!("Destroyed {} port pairs", destroyed);
    Ok(())
}

async fn demo_host(topology: &Topology, device: &str, name: &str) -> Result<Arc<Host>> {
    let mut labels = Labels::new();
    labels.insert("demo".to_string(), "true".to_string());
    topology
        .new_host(device, name, labels, &Properties::new())
        .await
        .with_context(|| format!("creating {} {}", device, name))
}

/// Link `host` to `peer`; on failure the host is removed again
async fn demo_link(topology: &Topology, host: &Arc<Host>, peer: &Arc<Host>) -> Result<sitelink::Link> {
    match topology.link(host, peer).await {
        Ok(link) => Ok(link),
        Err(failure) => {
            warn!(
                "Linking {} to {} failed at {}, removing {}",
                host.name(),
                peer.name(),
                failure.stage,
                host.name()
            );
            if let Err(e) = topology.remove_host(host).await {
                warn!("Cleanup of {} failed: {}", host.name(), e);
            }
            Err(failure.into())
        }
    }
}

/// Implementation of the 'demo' command: two sites on one switch
pub async fn cmd_demo(topology: &Topology, keep: bool) -> Result<()> {
    let h1 = demo_host(topology, "site", "h1").await?;
    let h2 = demo_host(topology, "site", "h2").await?;
    let s1 = demo_host(topology, "switch", "s1").await?;

    s1.start().await.context("starting switch")?;
    for host in [&h1, &h2] {
        host.start().await.with_context(|| format!("starting {}", host.name()))?;
    }

    let l1 = demo_link(topology, &h1, &s1).await?;
    let l2 = demo_link(topology, &h2, &s1).await?;

    topology
        .add_address(&h1, l1.local().port(), "192.168.5.5/24")
        .await?;
    topology
        .add_address(&h2, l2.local().port(), "192.168.5.4/24")
        .await?;

    let h1_links = topology.host_links(&h1).await?;
    println!("{} has {} link(s)", h1.name(), h1_links.len());
    for link in &h1_links {
        println!("  {}", link);
    }

    let links = topology.links().await?;
    println!("Topology has {} link(s)", links.len());
    for link in &links {
        println!("  {}", link);
    }

    if keep {
        info!("Leaving demo topology in place");
        return Ok(());
    }

    for host in [&h1, &h2] {
        topology.unlink(host, &s1).await?;
    }
    for host in [h1, h2, s1] {
        topology.remove_host(&host).await?;
    }
    println!("Demo topology removed");
    Ok(())
}
