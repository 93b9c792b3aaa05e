//! Built-in device managers
//!
//! - [`SiteManager`]: sites are named network namespaces
//! - [`SwitchManager`]: switches are Linux bridges in a working namespace

mod site;
mod switch;

pub use site::{SiteConfig, SiteManager, SITE_DEVICE};
pub use switch::{SwitchConfig, SwitchManager, SWITCH_DEVICE};

use crate::node::{Node, Properties};
use crate::port::{Port, PortStats};
use crate::{Error, Result};
use tokio::time::{sleep, Duration};

/// Polls made after a start/stop before giving up on it
pub const STATE_POLL_ATTEMPTS: usize = 10;
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait until `node.running()` reports `want`
pub(crate) async fn wait_running(node: &dyn Node, want: bool) -> Result<()> {
    for _ in 0..STATE_POLL_ATTEMPTS {
        if node.running().await == want {
            return Ok(());
        }
        sleep(STATE_POLL_INTERVAL).await;
    }
    Err(Error::Node(format!(
        "{} {} did not become {} after {} checks",
        node.device(),
        node.id(),
        if want { "running" } else { "stopped" },
        STATE_POLL_ATTEMPTS
    )))
}

/// Summed counters of `ports`, in node stats shape
pub(crate) fn port_stats(ports: &[Port]) -> Properties {
    let mut total = PortStats::default();
    for port in ports {
        total.accumulate(&port.stats);
    }
    total.to_properties()
}
