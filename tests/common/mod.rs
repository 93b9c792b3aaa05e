#![allow(dead_code)]

use async_trait::async_trait;
use sitelink::node::{Labels, Manager, Node, NodeFilter, Properties};
use sitelink::{
    Error, Fabric, MemoryFabric, NetNs, Port, PortPool, PoolConfig, Registry, Result, Topology,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const STUB_DEVICE: &str = "stub";

/// Initialize logging for tests
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sitelink=debug")
        .with_test_writer()
        .try_init();
}

/// Topology over an in-memory fabric with the built-in managers set up
pub async fn memory_topology() -> (Arc<MemoryFabric>, Topology) {
    let fabric = Arc::new(MemoryFabric::new());
    let dyn_fabric: Arc<dyn Fabric> = fabric.clone();
    let pool = Arc::new(PortPool::new(dyn_fabric.clone(), &PoolConfig::default()));
    let registry = Arc::new(Registry::with_builtin(dyn_fabric, pool.clone()));
    registry.register(Arc::new(StubManager::default()));
    registry.setup_all(&Default::default()).await;
    (fabric, Topology::new(registry, pool))
}

/// Node whose state signals are set by the test
#[derive(Default)]
pub struct StubNode {
    pub inspectable: AtomicBool,
    pub running: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl StubNode {
    pub fn new(inspectable: bool, running: bool) -> Arc<Self> {
        let node = Self::default();
        node.inspectable.store(inspectable, Ordering::SeqCst);
        node.running.store(running, Ordering::SeqCst);
        Arc::new(node)
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Node for StubNode {
    fn id(&self) -> String {
        "stub-1".to_string()
    }

    async fn name(&self) -> Result<String> {
        Ok("stub".to_string())
    }

    fn device(&self) -> &str {
        STUB_DEVICE
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn info(&self) -> Result<Properties> {
        if self.inspectable.load(Ordering::SeqCst) {
            Ok(Properties::new())
        } else {
            Err(Error::NodeNotFound(self.id()))
        }
    }

    fn netns(&self) -> NetNs {
        NetNs::named_at("/run/sitelink-test", "stub")
    }

    async fn ports(&self) -> Result<Vec<Port>> {
        Ok(Vec::new())
    }

    async fn port_add(&self, _port: &Port) -> Result<Port> {
        Err(Error::Node("stub nodes take no ports".to_string()))
    }

    async fn port_remove(&self, _port: &Port) -> Result<()> {
        Err(Error::Node("stub nodes take no ports".to_string()))
    }

    async fn stats(&self) -> Result<Properties> {
        Ok(Properties::new())
    }
}

/// Manager that only accepts removals of stub nodes
#[derive(Default)]
pub struct StubManager {
    pub removed: AtomicUsize,
}

#[async_trait]
impl Manager for StubManager {
    fn device(&self) -> &str {
        STUB_DEVICE
    }

    async fn setup(&self, _config: &Properties) -> Result<()> {
        Ok(())
    }

    async fn info(&self) -> Result<Properties> {
        Ok(Properties::new())
    }

    fn icon(&self) -> &str {
        "question"
    }

    fn color(&self) -> &str {
        "Gray"
    }

    async fn nodes(&self, _filters: &[NodeFilter]) -> Result<Vec<Arc<dyn Node>>> {
        Ok(Vec::new())
    }

    async fn add(&self, _name: &str, _labels: Labels, _config: &Properties) -> Result<Arc<dyn Node>> {
        Ok(StubNode::new(true, false))
    }

    async fn remove(&self, _node: &dyn Node) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
