//! Topology behaviour over the in-memory fabric

mod common;

use common::{init_logging, memory_topology, StubNode};
use ipnetwork::Ipv4Network;
use sitelink::node::{Labels, Properties};
use sitelink::{Error, Fabric, HostFilter, HostState, LinkStage, NetNs};
use std::sync::Arc;

fn no_labels() -> Labels {
    Labels::new()
}

#[tokio::test]
async fn test_new_host_then_remove_round_trip() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let existing = topology
        .new_host("site", "keep", no_labels(), &Properties::new())
        .await
        .unwrap();
    let before: Vec<String> = topology.hosts().iter().map(|h| h.id().to_string()).collect();

    for device in ["site", "switch"] {
        let host = topology
            .new_host(device, "temp", no_labels(), &Properties::new())
            .await
            .unwrap();
        assert_eq!(topology.hosts().len(), 2);
        topology.remove_host(&host).await.unwrap();

        let after: Vec<String> = topology.hosts().iter().map(|h| h.id().to_string()).collect();
        assert_eq!(before, after);
    }
    assert_eq!(topology.host(existing.id()).unwrap().name(), "keep");
}

#[tokio::test]
async fn test_failed_remove_keeps_host() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let host = topology
        .new_host("site", "h1", no_labels(), &Properties::new())
        .await
        .unwrap();
    // Remove the node behind the topology's back
    let manager = topology.registry().get("site").unwrap();
    manager.remove(host.node().as_ref()).await.unwrap();

    assert!(matches!(
        topology.remove_host(&host).await,
        Err(Error::NodeNotFound(_))
    ));
    assert_eq!(topology.hosts().len(), 1);
    assert_eq!(host.state().await, HostState::Removed);
}

#[tokio::test]
async fn test_link_unlink_restores_pool() {
    init_logging();
    let (_, topology) = memory_topology().await;
    let pool = topology.pool().clone();

    // An idle pair so the baseline is not trivially zero
    pool.create_port_pair().await.unwrap();
    let baseline = pool.ports(&[]).await.unwrap().len();
    assert_eq!(baseline, 2);

    let a = topology
        .new_host("site", "a", no_labels(), &Properties::new())
        .await
        .unwrap();
    let b = topology
        .new_host("switch", "b", no_labels(), &Properties::new())
        .await
        .unwrap();

    topology.link(&a, &b).await.unwrap();
    assert_eq!(pool.ports(&[]).await.unwrap().len(), baseline);
    assert_eq!(a.node().ports().await.unwrap().len(), 1);
    assert_eq!(b.node().ports().await.unwrap().len(), 1);

    assert_eq!(topology.unlink(&a, &b).await.unwrap(), 1);
    assert_eq!(pool.ports(&[]).await.unwrap().len(), baseline);
    assert!(a.node().ports().await.unwrap().is_empty());
    assert!(b.node().ports().await.unwrap().is_empty());

    // Nothing left to unlink
    assert_eq!(topology.unlink(&a, &b).await.unwrap(), 0);
}

#[tokio::test]
async fn test_host_state_follows_node() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let cases = [
        (true, true, HostState::Running),
        (true, false, HostState::Ready),
        (false, true, HostState::Removed),
        (false, false, HostState::Removed),
    ];
    for (inspectable, running, expected) in cases {
        let node = StubNode::new(inspectable, running);
        let host = topology.new_host_from_node(node).await.unwrap();
        assert_eq!(host.state().await, expected);
    }
}

#[tokio::test]
async fn test_start_stop_guards_skip_node() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let running = StubNode::new(true, true);
    let host = topology.new_host_from_node(running.clone()).await.unwrap();
    let err = host.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            expected: HostState::Ready,
            actual: HostState::Running,
            ..
        }
    ));
    assert_eq!(running.starts(), 0);

    let ready = StubNode::new(true, false);
    let host = topology.new_host_from_node(ready.clone()).await.unwrap();
    assert!(host.stop().await.is_err());
    assert_eq!(ready.stops(), 0);

    // Valid transitions reach the node once each
    let created = host.updated_at();
    host.start().await.unwrap();
    assert_eq!(ready.starts(), 1);
    assert!(host.updated_at() >= created);
    host.stop().await.unwrap();
    assert_eq!(ready.stops(), 1);
}

#[tokio::test]
async fn test_ports_and_stats_need_live_host() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let host = topology
        .new_host("site", "h1", no_labels(), &Properties::new())
        .await
        .unwrap();
    assert!(host.ports().await.unwrap().is_empty());
    assert!(host.stats().await.is_err());

    host.start().await.unwrap();
    assert_eq!(host.state().await, HostState::Running);
    assert!(host.stats().await.is_ok());

    let gone = StubNode::new(false, false);
    let gone = topology.new_host_from_node(gone).await.unwrap();
    assert!(matches!(
        gone.ports().await,
        Err(Error::InvalidState {
            actual: HostState::Removed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_sites_and_switch_scenario() {
    init_logging();
    let (fabric, topology) = memory_topology().await;

    let h1 = topology
        .new_host("site", "h1", no_labels(), &Properties::new())
        .await
        .unwrap();
    let h2 = topology
        .new_host("site", "h2", no_labels(), &Properties::new())
        .await
        .unwrap();
    let s1 = topology
        .new_host("switch", "s1", no_labels(), &Properties::new())
        .await
        .unwrap();

    let l1 = topology.link(&h1, &s1).await.unwrap();
    let l2 = topology.link(&h2, &s1).await.unwrap();

    topology
        .add_address(&h1, l1.local().port(), "192.168.5.5/24")
        .await
        .unwrap();
    topology
        .add_address(&h2, l2.local().port(), "192.168.5.4/24")
        .await
        .unwrap();
    assert_eq!(
        fabric.addresses_of(&h1.netns(), &l1.local().port().name),
        vec!["192.168.5.5/24".parse::<Ipv4Network>().unwrap()]
    );

    let h1_links = topology.host_links(&h1).await.unwrap();
    assert_eq!(h1_links.len(), 1);
    assert_eq!(h1_links[0].peer().host().id(), s1.id());

    // The switch sees both links from its side
    assert_eq!(topology.host_links(&s1).await.unwrap().len(), 2);

    let links = topology.links().await.unwrap();
    assert_eq!(links.len(), 2);
    let mut seen = std::collections::HashSet::new();
    for link in &links {
        let mut pair = [
            (link.local().host().id().to_string(), link.local().port().index),
            (link.peer().host().id().to_string(), link.peer().port().index),
        ];
        pair.sort();
        assert!(seen.insert(pair), "pair reported twice: {}", link);
    }

    assert!(topology
        .add_address(&h1, l1.local().port(), "192.168.5.300/24")
        .await
        .is_err());
}

#[tokio::test]
async fn test_clear_pool_scenario() {
    init_logging();
    let (fabric, topology) = memory_topology().await;
    let pool = topology.pool().clone();

    let (a, b) = pool.create_port_pair().await.unwrap();
    let (c, d) = pool.create_port_pair().await.unwrap();
    pool.clear().await.unwrap();

    assert!(pool.ports(&[]).await.unwrap().is_empty());
    let netns = pool.net_ns().await.unwrap();
    for port in [a, b, c, d] {
        assert!(fabric.port_by_name(&netns, &port.name).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_peer_attach_failure_is_reported() {
    init_logging();
    let (fabric, topology) = memory_topology().await;

    let a = topology
        .new_host("site", "a", no_labels(), &Properties::new())
        .await
        .unwrap();
    let b = topology
        .new_host("site", "b", no_labels(), &Properties::new())
        .await
        .unwrap();
    fabric.fail_moves_into(&b.netns());

    let failure = topology.link(&a, &b).await.unwrap_err();
    assert_eq!(failure.stage, LinkStage::PeerAttach);
    let (attached, stranded) = failure.ports.clone().unwrap();

    // The local side stays attached, the peer end waits in the pool
    assert_eq!(a.node().ports().await.unwrap().len(), 1);
    let idle = topology.pool().ports(&[]).await.unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].name, stranded.name);

    // Caller compensates
    a.node().port_remove(&attached).await.unwrap();
    topology.pool().destroy_port_pair(&attached).await.unwrap();
    assert!(topology.pool().ports(&[]).await.unwrap().is_empty());

    // Also usable through the crate error
    let err: Error = topology.link(&a, &b).await.unwrap_err().into();
    assert!(err.to_string().contains("peer attach"));
}

#[tokio::test]
async fn test_self_attach_failure_is_reported() {
    init_logging();
    let (fabric, topology) = memory_topology().await;

    let a = topology
        .new_host("site", "a", no_labels(), &Properties::new())
        .await
        .unwrap();
    let b = topology
        .new_host("site", "b", no_labels(), &Properties::new())
        .await
        .unwrap();
    fabric.fail_moves_into(&a.netns());

    let failure = topology.link(&a, &b).await.unwrap_err();
    assert_eq!(failure.stage, LinkStage::SelfAttach);
    assert!(failure.ports.is_some());
    assert_eq!(topology.pool().ports(&[]).await.unwrap().len(), 2);
    assert!(b.node().ports().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_rebuilds_hosts() {
    init_logging();
    let (_, topology) = memory_topology().await;

    let mut labels = Labels::new();
    labels.insert("tier".into(), "edge".into());
    let h1 = topology
        .new_host("site", "h1", labels, &Properties::new())
        .await
        .unwrap();
    let s1 = topology
        .new_host("switch", "s1", no_labels(), &Properties::new())
        .await
        .unwrap();
    topology.link(&h1, &s1).await.unwrap();
    topology
        .new_host_from_node(StubNode::new(true, false))
        .await
        .unwrap();

    assert_eq!(topology.load().await.unwrap(), 2);

    let hosts = topology.hosts();
    assert!(hosts.iter().all(|h| h.id() != h1.id() && h.id() != s1.id()));
    assert!(hosts.iter().all(|h| h.labels().is_empty()));
    let mut names: Vec<&str> = hosts.iter().map(|h| h.name()).collect();
    names.sort();
    assert_eq!(names, vec!["h1", "s1"]);

    // Links survive the resync since they live in the kernel
    assert_eq!(topology.links().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_load_ignores_foreign_bridges() {
    init_logging();
    let (fabric, topology) = memory_topology().await;

    // Bridge and wire that predate sitelink on the host namespace
    let host_ns = NetNs::current();
    let docker0 = fabric.create_bridge(&host_ns, "docker0").await.unwrap();
    let (veth, _) = fabric.create_veth(&host_ns, "veth0", "veth1").await.unwrap();
    fabric
        .set_controller(&host_ns, veth.index, Some(docker0.index))
        .await
        .unwrap();

    topology
        .new_host("site", "h1", no_labels(), &Properties::new())
        .await
        .unwrap();
    topology
        .new_host("switch", "s1", no_labels(), &Properties::new())
        .await
        .unwrap();

    assert_eq!(topology.load().await.unwrap(), 2);
    let mut names: Vec<String> = topology
        .hosts()
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["h1", "s1"]);

    let switches = topology.hosts_filtered(&[HostFilter::Name("s1".into())]);
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].device(), "switch");

    let before = fabric.link_count();
    topology.remove_host(&switches[0]).await.unwrap();
    assert_eq!(fabric.link_count(), before - 1);
    assert!(fabric
        .port_by_name(&host_ns, "docker0")
        .await
        .unwrap()
        .is_some());
    assert!(fabric.port_by_name(&host_ns, "veth0").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_host_creation() {
    init_logging();
    let (_, topology) = memory_topology().await;
    let topology = Arc::new(topology);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let topology = topology.clone();
        tasks.push(tokio::spawn(async move {
            topology
                .new_host("site", &format!("c{}", i), Labels::new(), &Properties::new())
                .await
                .map(|h| h.id().to_string())
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(topology.hosts().len(), 8);
}
