use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_gateway::GatewayConfig;

/// Engine configuration. Every timing constant in the engine is tunable
/// here. Values load from an optional JSON file and can be overridden with
/// `TETHER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet interval before an incremental persistence flush.
    pub persist_debounce_ms: u64,
    /// How long a finished parent run stays in the registry for late attach.
    pub parent_grace_ms: u64,
    /// How long a finished dependent run stays in the registry. Much longer
    /// than the parent grace: its events are durably persisted anyway.
    pub subagent_grace_ms: u64,
    /// Delay between the graceful termination signal and the forceful one.
    pub kill_escalation_ms: u64,
    /// Gateway reconnect backoff floor.
    pub gateway_backoff_floor_ms: u64,
    /// Gateway reconnect backoff cap.
    pub gateway_backoff_cap_ms: u64,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 2_000,
            parent_grace_ms: 30_000,
            subagent_grace_ms: 24 * 60 * 60 * 1000,
            kill_escalation_ms: 5_000,
            gateway_backoff_floor_ms: 1_000,
            gateway_backoff_cap_ms: 30_000,
            gateway_url: None,
            gateway_token: None,
            state_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TETHER_STATE_DIR") {
            if !dir.trim().is_empty() {
                self.state_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(url) = std::env::var("TETHER_GATEWAY_URL") {
            if !url.trim().is_empty() {
                self.gateway_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("TETHER_GATEWAY_TOKEN") {
            if !token.trim().is_empty() {
                self.gateway_token = Some(token);
            }
        }
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn parent_grace(&self) -> Duration {
        Duration::from_millis(self.parent_grace_ms)
    }

    pub fn subagent_grace(&self) -> Duration {
        Duration::from_millis(self.subagent_grace_ms)
    }

    pub fn kill_escalation(&self) -> Duration {
        Duration::from_millis(self.kill_escalation_ms)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let defaults = GatewayConfig::default();
        GatewayConfig {
            url: self.gateway_url.clone().unwrap_or(defaults.url),
            token: self.gateway_token.clone(),
            backoff_floor: Duration::from_millis(self.gateway_backoff_floor_ms),
            backoff_cap: Duration::from_millis(self.gateway_backoff_cap_ms),
        }
    }
}
