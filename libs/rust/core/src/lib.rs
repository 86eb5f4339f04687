//! Core shared utilities for compute-mesh nodes: tracing, configuration and identity.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod config;
pub mod identity;

pub use config::{load_config, ConsensusSettings, NodeConfig};
pub use identity::{IdentityError, Keypair, PeerId};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `MESH_JSON_LOG=1` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    let json = std::env::var("MESH_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    init_tracing_with(service, json)
}

pub fn init_tracing_with(service: &str, json: bool) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "mesh_core", service, "tracing initialized");
    Ok(())
}
