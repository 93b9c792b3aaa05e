//! Configuration file
//!
//! ```json
//! {
//!   "pool": { "dir": "/run/sitelink", "name": "sitelink-ports" },
//!   "managers": {
//!     "site": { "dir": "/run/sitelink/sites", "prefix": "site-" },
//!     "switch": { "prefix": "sl-" }
//!   }
//! }
//! ```
//!
//! Every section is optional. Unknown keys are ignored.

use crate::node::Properties;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SITELINK_CONFIG";

/// File looked up in the working directory when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "sitelink.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the pool namespace file
    pub dir: PathBuf,
    /// Pool namespace name
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
            name: "sitelink-ports".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    /// Setup maps keyed by device kind
    pub managers: HashMap<String, Properties>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the configuration: an explicit path must exist, then
    /// `$SITELINK_CONFIG`, then `./sitelink.json`, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Self::from_file(Path::new(&path));
            }
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Setup map for one device kind; empty when absent
    pub fn manager(&self, device: &str) -> Properties {
        self.managers.get(device).cloned().unwrap_or_default()
    }
}

/// Decode a flat property map into a typed config
pub fn decode<T: DeserializeOwned>(props: &Properties) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(props.clone()))
        .map_err(|e| Error::InvalidConfig(e.to_string()))
}
