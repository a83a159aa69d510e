use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::dag::CascadePolicy;
use crate::log::LogFormat;
use crate::orchestration::router::LoadBalancePolicy;
use crate::{Error, Result};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7420";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub registry: RegistryConfig,
    pub admission: AdmissionConfig,
    pub dispatch: DispatchConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub dependencies: DependencyConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Capacity of the coordinator's caller inbox.
    pub inbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            inbox_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected seconds between agent heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Missed intervals before an agent is evicted.
    pub missed_heartbeats: u32,
    /// Missed intervals before an agent is marked degraded.
    pub degraded_after: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            missed_heartbeats: 3,
            degraded_after: 1,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub session_ceiling: f64,
    pub global_ceiling: f64,
    pub warning_threshold: f64,
    /// Force parallelism to 1 for every task.
    pub single_agent_mode: bool,
    /// Force parallelism to 1 for tasks estimated in the lowest tier.
    pub single_agent_for_low_tier: bool,
    /// Defer instead of approving when no agent advertises the capabilities.
    pub defer_when_no_agents: bool,
    pub base_cost: f64,
    pub cost_per_kib: f64,
    /// Upper bounds (inclusive) of the low, medium and high tiers.
    pub tier_bounds: [f64; 3],
    /// Multipliers per agent type; unknown types use 1.0.
    pub agent_type_weights: HashMap<String, f64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let mut agent_type_weights = HashMap::new();
        agent_type_weights.insert("search".to_string(), 0.5);
        agent_type_weights.insert("analysis".to_string(), 1.0);
        agent_type_weights.insert("synthesis".to_string(), 1.5);
        Self {
            session_ceiling: 5.0,
            global_ceiling: 100.0,
            warning_threshold: 4.0,
            single_agent_mode: false,
            single_agent_for_low_tier: false,
            defer_when_no_agents: true,
            base_cost: 0.1,
            cost_per_kib: 0.01,
            tier_bounds: [0.25, 1.0, 3.0],
            agent_type_weights,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    pub policy: LoadBalancePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub per_agent_type: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 300,
            per_agent_type: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Task timeout for an agent type, falling back to the default.
    pub fn for_agent_type(&self, agent_type: &str) -> Duration {
        Duration::from_secs(
            self.per_agent_type
                .get(agent_type)
                .copied()
                .unwrap_or(self.default_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DependencyConfig {
    pub cascade: CascadePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    pub snapshot_path: Option<String>,
}

impl StateConfig {
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot_path.as_deref().map(expand_tilde)
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            tracing::debug!("config file not found, using defaults");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("CONDUCTOR_LISTEN") {
            if !addr.trim().is_empty() {
                self.server.listen_addr = addr;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.heartbeat_interval_secs == 0 {
            return Err(Error::Validation(
                "registry.heartbeat_interval_secs must be > 0".to_string(),
            ));
        }
        if self.registry.missed_heartbeats == 0 {
            return Err(Error::Validation(
                "registry.missed_heartbeats must be > 0".to_string(),
            ));
        }
        let a = &self.admission;
        if a.warning_threshold > a.session_ceiling {
            return Err(Error::Validation(format!(
                "admission.warning_threshold ({}) exceeds session_ceiling ({})",
                a.warning_threshold, a.session_ceiling
            )));
        }
        if a.tier_bounds.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Validation(
                "admission.tier_bounds must be ascending".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Validation(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
