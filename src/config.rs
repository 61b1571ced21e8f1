//! Pool configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) yields a runnable single-port setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::params::*;
use crate::error::ConfigError;

/// One stratum listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub port: u16,
    /// Accept logins whose password requests solo mining
    pub allow_solo: bool,
    /// Accept `eth_*` (getwork/EthProxy) logins
    pub allow_pull: bool,
    /// Accept `mining.*` (EthereumStratum/1.0.0) logins
    pub allow_push: bool,
    /// Starting difficulty for sessions on this port
    pub difficulty: f64,
    /// Whether the retarget sweep adjusts sessions on this port
    pub var_diff: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port: 8008,
            allow_solo: true,
            allow_pull: true,
            allow_push: true,
            difficulty: 1_000.0,
            var_diff: true,
        }
    }
}

/// Variable difficulty tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarDiffConfig {
    /// Desired seconds between shares
    pub target_interval_secs: f64,
    /// Half-width of the no-change band, in percent of the target interval
    pub variance_percent: f64,
    /// Largest change allowed per retarget, in percent of current difficulty
    pub max_jump_percent: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    pub retarget_interval_secs: u64,
    /// Share intervals remembered per session
    pub history_size: usize,
    /// Chain-specific difficulty unit; targets are derived from
    /// `difficulty * unit_multiplier`
    pub unit_multiplier: f64,
    /// Compare min/max bounds against the scaled difficulty
    pub scale_bounds: bool,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_interval_secs: 15.0,
            variance_percent: 30.0,
            max_jump_percent: 100.0,
            min_difficulty: 100.0,
            max_difficulty: 1_000_000_000.0,
            retarget_interval_secs: 60,
            history_size: DEFAULT_HISTORY_SIZE,
            unit_multiplier: 1.0,
            scale_bounds: false,
        }
    }
}

impl VarDiffConfig {
    /// Lowest session difficulty allowed, in session units.
    pub fn min_bound(&self) -> f64 {
        self.unbounded(self.min_difficulty)
    }

    /// Highest session difficulty allowed, in session units.
    pub fn max_bound(&self) -> f64 {
        self.unbounded(self.max_difficulty)
    }

    fn unbounded(&self, bound: f64) -> f64 {
        if self.scale_bounds && self.unit_multiplier > 0.0 {
            bound / self.unit_multiplier
        } else {
            bound
        }
    }

    /// Clamp a difficulty into the configured bounds.
    pub fn clamp(&self, difficulty: f64) -> f64 {
        difficulty.max(self.min_bound()).min(self.max_bound())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upstream node JSON-RPC endpoint, `host:port`
    pub upstream: String,
    /// Per-call deadline for node requests
    pub upstream_timeout_ms: u64,
    pub ports: Vec<PortConfig>,
    pub var_diff: VarDiffConfig,
    /// Blocks per verification epoch
    pub epoch_length: u64,
    /// Verification dataset size in bytes (multiple of 64)
    pub dataset_size: usize,
    /// Jobs retained below the top height
    pub max_backlog: u64,
    /// Sessions silent this long are disconnected
    pub miner_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    pub refresh_interval_ms: u64,
    pub max_buffer_size: usize,
    /// Extranonce length in hex characters
    pub nonce_size: usize,
    pub get_work_timeout_ms: u64,
    /// How long a share waits for its epoch dataset before `ValidatorNotReady`
    pub validator_wait_ms: u64,
    pub epoch_generation_timeout_secs: u64,
    /// Persist generated datasets here (sled); in-memory only when unset
    pub cache_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            upstream: String::from("127.0.0.1:8545"),
            upstream_timeout_ms: 10_000,
            ports: vec![PortConfig::default()],
            var_diff: VarDiffConfig::default(),
            epoch_length: DEFAULT_EPOCH_LENGTH,
            dataset_size: 16 * 1024 * 1024,
            max_backlog: DEFAULT_MAX_BACKLOG,
            miner_timeout_secs: 900,
            idle_sweep_interval_secs: 30,
            refresh_interval_ms: 1_000,
            max_buffer_size: MAX_BUFFER_SIZE,
            nonce_size: DEFAULT_NONCE_SIZE,
            get_work_timeout_ms: 5_000,
            validator_wait_ms: 2_000,
            epoch_generation_timeout_secs: 300,
            cache_dir: None,
        }
    }
}

impl PoolConfig {
    /// Read and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.ports.is_empty() {
            return invalid("at least one stratum port is required".into());
        }
        for (i, p) in self.ports.iter().enumerate() {
            if self.ports[..i].iter().any(|q| q.port == p.port) {
                return invalid(format!("port {} listed twice", p.port));
            }
            if !p.allow_pull && !p.allow_push {
                return invalid(format!("port {} allows no dialect", p.port));
            }
            if !(p.difficulty > 0.0) {
                return invalid(format!("port {} difficulty must be positive", p.port));
            }
        }

        let vd = &self.var_diff;
        if !(vd.min_difficulty > 0.0) || vd.min_difficulty > vd.max_difficulty {
            return invalid("var_diff bounds must satisfy 0 < min <= max".into());
        }
        if !(vd.target_interval_secs > 0.0) {
            return invalid("var_diff target interval must be positive".into());
        }
        if !(0.0..100.0).contains(&vd.variance_percent) {
            return invalid("var_diff variance must be in [0, 100)".into());
        }
        if !(vd.max_jump_percent > 0.0) {
            return invalid("var_diff max jump must be positive".into());
        }
        if vd.retarget_interval_secs == 0 || vd.history_size == 0 {
            return invalid("var_diff retarget interval and history size must be non-zero".into());
        }
        if !(vd.unit_multiplier > 0.0) {
            return invalid("var_diff unit multiplier must be positive".into());
        }

        if self.epoch_length == 0 {
            return invalid("epoch_length must be non-zero".into());
        }
        if self.dataset_size < 64 || self.dataset_size % 64 != 0 {
            return invalid("dataset_size must be a non-zero multiple of 64".into());
        }
        if self.nonce_size == 0 || self.nonce_size >= NONCE_HEX_LEN {
            return invalid(format!("nonce_size must be in 1..{}", NONCE_HEX_LEN));
        }
        if self.max_buffer_size == 0 {
            return invalid("max_buffer_size must be non-zero".into());
        }
        if self.upstream_timeout_ms == 0 {
            return invalid("upstream_timeout_ms must be non-zero".into());
        }
        if self.refresh_interval_ms == 0 || self.idle_sweep_interval_secs == 0 {
            return invalid("sweep intervals must be non-zero".into());
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn miner_timeout(&self) -> Duration {
        Duration::from_secs(self.miner_timeout_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn retarget_interval(&self) -> Duration {
        Duration::from_secs(self.var_diff.retarget_interval_secs)
    }

    pub fn get_work_timeout(&self) -> Duration {
        Duration::from_millis(self.get_work_timeout_ms)
    }

    pub fn validator_wait(&self) -> Duration {
        Duration::from_millis(self.validator_wait_ms)
    }

    pub fn epoch_generation_timeout(&self) -> Duration {
        Duration::from_secs(self.epoch_generation_timeout_secs)
    }
}
