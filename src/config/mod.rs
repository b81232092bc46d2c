//! Runtime configuration: the static twin table and CLI-facing enums.
//!
//! The binary wires everything else (broker address, identity, worker
//! count) straight from command-line flags; only the twin table warrants a
//! file format.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One row of the static twin directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinEntry {
    pub id: u32,
    /// Host or IP the twin's gateway listens on.
    pub location: String,
    /// Hex-encoded 32-byte verification key; optional because a table used
    /// purely for outbound routing never verifies.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Static twin directory, loaded from a TOML file of `[[twins]]` entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinTable {
    #[serde(default)]
    pub twins: Vec<TwinEntry>,
}

impl TwinTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read twin table {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse twin table {}", path.display()))
    }
}

/// Broker selection for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Production: a Redis server shared with local producers/consumers.
    Redis,
    /// Single-process smoke runs and tests; state dies with the process.
    Memory,
}
