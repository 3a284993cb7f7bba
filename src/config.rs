use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::turns::{TokenRates, TurnLimits, WarningThresholds};
use crate::{Error, Result};
use tracing::debug;

/// Default timeout for a provider invocation (10 minutes).
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    /// Directory for persisted sessions. Defaults to ~/.mesh/sessions.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub turns: TurnConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Budget defaults applied to every new session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TurnConfig {
    pub limits: TurnLimits,
    pub warnings: WarningThresholds,
    pub rates: TokenRates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Message ids retained per channel queue.
    pub channel_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            default_ttl_ms: 300_000,
            sweep_interval_ms: 60_000,
            channel_history: 100,
        }
    }
}

impl BusConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Characters kept from each dependency output when building task context.
    pub context_chars: usize,
    /// Parallelization benefit (percent) above which the parallel strategy is chosen.
    pub parallel_threshold_percent: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            context_chars: 500,
            parallel_threshold_percent: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS))
    }
}

impl MeshConfig {
    pub fn mesh_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".mesh"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::mesh_dir()?.join("mesh.toml"))
    }

    pub fn sessions_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::mesh_dir()?.join("sessions")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "MeshConfig::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml(&fs::read_to_string(&path)?)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        debug!(
            max_turns = config.turns.limits.max_turns,
            max_retries = config.bus.max_retries,
            command = config.provider.effective_command(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let mesh_dir = Self::mesh_dir()?;
        if !mesh_dir.exists() {
            debug!("Creating mesh directory");
            fs::create_dir_all(&mesh_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.state_dir.is_none());
        assert_eq!(config.provider.effective_command(), "claude");
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.coordinator.context_chars, 500);
        assert_eq!(
            config.provider.timeout(),
            Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = expand_tilde("/absolute/path");
        assert_eq!(absolute, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [turns.limits]
            max_turns = 12

            [bus]
            max_retries = 5
        "#;
        let config = MeshConfig::from_toml(raw).unwrap();
        assert_eq!(config.turns.limits.max_turns, 12);
        assert_eq!(
            config.turns.limits.max_tokens,
            TurnLimits::default().max_tokens
        );
        assert_eq!(config.bus.max_retries, 5);
        assert_eq!(config.bus.retry_base_delay_ms, 1_000);
        assert_eq!(config.coordinator.parallel_threshold_percent, 30.0);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = MeshConfig {
            provider: ProviderConfig {
                command: Some("claude --model sonnet".to_string()),
                timeout_secs: Some(30),
            },
            state_dir: Some("~/mesh-state".to_string()),
            ..Default::default()
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed = MeshConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.provider.effective_command(), "claude --model sonnet");
        assert_eq!(parsed.provider.timeout(), Duration::from_secs(30));
        assert_eq!(parsed.state_dir, Some("~/mesh-state".to_string()));
    }
}
