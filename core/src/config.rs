//! Emulator configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::hostadapter::DEFAULT_SPIN_LIMIT;
use crate::picom::DEFAULT_LINK_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Size of the read-ahead buffer, in 256-byte sectors
    pub sector_buffer_sectors: usize,

    /// Iteration ceiling for a single bus handshake
    pub spin_limit: u32,

    /// Timeout for a complete companion exchange, in milliseconds
    pub link_timeout_ms: u64,

    /// Name prefix of the LUN directories
    pub directory_prefix: String,

    /// Create an empty image when starting a LUN that has none
    pub create_missing_images: bool,

    /// Hex-dump every sector moved across the bus
    pub trace_blocks: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sector_buffer_sectors: 2,
            spin_limit: DEFAULT_SPIN_LIMIT,
            link_timeout_ms: DEFAULT_LINK_TIMEOUT.as_millis() as u64,
            directory_prefix: "BeebSCSI".to_string(),
            create_missing_images: true,
            trace_blocks: false,
        }
    }
}

impl EmulatorConfig {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    /// Loads a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_json(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sector_buffer_sectors == 0 {
            bail!("sector_buffer_sectors must be at least 1");
        }
        if self.spin_limit == 0 {
            bail!("spin_limit must be at least 1");
        }
        if self.link_timeout_ms == 0 {
            bail!("link_timeout_ms must be at least 1");
        }
        Ok(())
    }
}
