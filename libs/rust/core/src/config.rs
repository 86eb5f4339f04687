//! Layered node configuration.
//!
//! Precedence (lowest first): built-in defaults, the file named by
//! `MESH_CONFIG_FILE`, then `MESH__*` environment variables
//! (e.g. `MESH__CONSENSUS__REQUEST_TIMEOUT_MS=5000`).

use anyhow::Result;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use config::builder::DefaultState;
use serde::Deserialize;
use std::time::Duration;

pub const CONFIG_FILE_ENV: &str = "MESH_CONFIG_FILE";

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub service_name: String,
    pub log_level: String,
    pub json_log: bool,
    pub consensus: ConsensusSettings,
}

/// Settings consumed by the consensus replicas of this node.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ConsensusSettings {
    pub network_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub cluster_size: usize,
}

impl ConsensusSettings {
    pub fn network_timeout(&self) -> Duration { Duration::from_millis(self.network_timeout_ms) }
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
}

impl Default for ConsensusSettings {
    fn default() -> Self { Self { network_timeout_ms: 10_000, request_timeout_ms: 30_000, cluster_size: 4 } }
}

fn defaults(service: &str) -> Result<ConfigBuilder<DefaultState>> {
    let d = ConsensusSettings::default();
    Ok(Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?
        .set_default("json_log", false)?
        .set_default("consensus.network_timeout_ms", d.network_timeout_ms)?
        .set_default("consensus.request_timeout_ms", d.request_timeout_ms)?
        .set_default("consensus.cluster_size", d.cluster_size as u64)?)
}

/// Load configuration from defaults, optional file and environment.
pub fn load_config(service: &str) -> Result<NodeConfig> {
    let mut builder = defaults(service)?;
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        tracing::debug!(file = %file, "loading config file");
        builder = builder.add_source(File::with_name(&file).required(false));
    }
    builder = builder.add_source(Environment::with_prefix("MESH").separator("__"));
    let cfg: NodeConfig = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

impl NodeConfig {
    /// Parse a YAML document layered over the defaults. Environment is not consulted.
    pub fn from_yaml_str(service: &str, text: &str) -> Result<Self> {
        let cfg = defaults(service)?.add_source(File::from_str(text, FileFormat::Yaml)).build()?;
        Ok(cfg.try_deserialize()?)
    }
}
