// =============================================================================
// Config & Bootstrap Surface
// =============================================================================
//
// Typed configuration, loaded from a JSON file with every field carrying a
// serde default, overridable via environment variables for the handful of
// per-deployment knobs, and persisted back atomically (the same tmp+rename
// pattern the teacher engine uses for its runtime config).
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decimal::{Decimal, Pair};

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_segment_threshold() -> usize {
    10_000
}

fn default_max_segments() -> usize {
    20
}

fn default_poll_price_interval_secs() -> u64 {
    15
}

fn default_sse_poll_interval_secs() -> u64 {
    3
}

fn default_sse_heartbeat_interval_secs() -> u64 {
    25
}

fn default_snapshot_thinning_keep_recent() -> usize {
    100
}

/// The subset of the strategy surface a deployment configures per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub pair: Pair,
    pub amount: Decimal,
    pub max_dca_trades: u32,
    pub dca_percent_threshold_buy: Decimal,
    pub dca_percent_threshold_sell: Decimal,
    #[serde(default = "default_poll_price_interval_secs")]
    pub poll_price_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    #[serde(default)]
    pub admin_token: String,
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: usize,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    #[serde(default = "default_sse_poll_interval_secs")]
    pub sse_poll_interval_secs: u64,
    #[serde(default = "default_sse_heartbeat_interval_secs")]
    pub sse_heartbeat_interval_secs: u64,
    #[serde(default = "default_snapshot_thinning_keep_recent")]
    pub snapshot_thinning_keep_recent: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            state_dir: default_state_dir(),
            pairs: Vec::new(),
            admin_token: String::new(),
            segment_threshold: default_segment_threshold(),
            max_segments: default_max_segments(),
            sse_poll_interval_secs: default_sse_poll_interval_secs(),
            sse_heartbeat_interval_secs: default_sse_heartbeat_interval_secs(),
            snapshot_thinning_keep_recent: default_snapshot_thinning_keep_recent(),
        }
    }
}

impl Config {
    /// Load `path`, creating it from defaults if it doesn't exist yet, then
    /// apply environment overrides for the per-deployment knobs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            warn!(path = %path.display(), "no config file found, starting from defaults");
            Self::default()
        };

        config.apply_env_overrides();
        info!(path = %path.display(), pairs = config.pairs.len(), "config loaded");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("DCA_BIND_ADDRESS") {
            self.bind_address = bind;
        }
        if let Ok(dir) = std::env::var("DCA_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(token) = std::env::var("DCA_ADMIN_TOKEN") {
            self.admin_token = token;
        }
    }

    /// Persist the current configuration atomically (write to a `.tmp`
    /// sibling, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
