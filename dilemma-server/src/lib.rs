use anyhow::{Context, Result};
use dilemma_core::validate_config;
use dilemma_types::{simulation_config_from_toml_str, SimulationConfig};
use std::path::Path;

pub mod protocol;
pub mod scheduler;

pub use scheduler::Scheduler;

/// Reads a TOML config from `path`, or the built-in defaults when `None`.
pub fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    let config = match path {
        Some(path) => load_config_from_path(path)?,
        None => SimulationConfig::default(),
    };
    validate_config(&config).context("simulation config rejected")?;
    Ok(config)
}

pub fn load_config_from_path(path: &Path) -> Result<SimulationConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read simulation config from {}", path.display()))?;
    simulation_config_from_toml_str(&raw)
        .context("simulation config TOML failed schema deserialization")
        .with_context(|| format!("failed to parse simulation config from {}", path.display()))
}
