//! Engine and reference-agent tuning.
//!
//! Loaded from `engine_config.json` with support for an environment variable
//! override (`ROVER_ENGINE_CONFIG_PATH`).

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use program_runtime::registry::{MOVEMENT_MODULE, ORIENTATION_SIGNAL, POSITION_SIGNAL};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::navigator::NavigatorConfig;
use crate::resource_field::{DEFAULT_HARVEST_DISTANCE, DEFAULT_SCAN_FOV_DEGREES, DEFAULT_SCAN_MAX_RESULTS};

pub const BUILTIN_ENGINE_CONFIG: &str = include_str!("data/engine_config.json");
pub const ENGINE_CONFIG_ENV: &str = "ROVER_ENGINE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timing: TimingConfig,
    pub use_item: UseItemConfig,
    pub navigator: NavigatorConfig,
    pub field: FieldDefaults,
    pub telemetry: TelemetryConfig,
    pub agent: AgentConfig,
}

impl EngineConfig {
    /// Parses the embedded config; a broken embed falls back to the defaults.
    pub fn builtin() -> Arc<Self> {
        match Self::from_json_str(BUILTIN_ENGINE_CONFIG) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                tracing::warn!(target: "rover::config", error = %err, "engine_config.builtin_invalid");
                Arc::new(Self::default())
            }
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| EngineConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    fn validate(&self) -> Result<(), EngineConfigError> {
        if !(self.timing.epsilon.is_finite() && self.timing.epsilon > 0.0) {
            return Err(EngineConfigError::Invalid("timing.epsilon must be positive".into()));
        }
        if self.timing.max_zero_time_advances == 0 {
            return Err(EngineConfigError::Invalid(
                "timing.max_zero_time_advances must be at least 1".into(),
            ));
        }
        if !(self.use_item.swing_interval.is_finite() && self.use_item.swing_interval > 0.0) {
            return Err(EngineConfigError::Invalid("use_item.swing_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Remaining time at or below this counts as finished.
    pub epsilon: f32,
    /// Consecutive advances without consuming time allowed per `update`.
    pub max_zero_time_advances: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-4,
            max_zero_time_advances: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UseItemConfig {
    pub max_swings: u32,
    /// Seconds between swings.
    pub swing_interval: f32,
}

impl Default for UseItemConfig {
    fn default() -> Self {
        Self {
            max_swings: 5,
            swing_interval: 0.6,
        }
    }
}

/// Defaults applied by the reference agent when it queries the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDefaults {
    pub scan_range: f32,
    pub scan_fov_degrees: f32,
    pub scan_max_results: usize,
    pub harvest_distance: f32,
    /// Quantity taken per `gather` action.
    pub gather_amount: f32,
}

impl Default for FieldDefaults {
    fn default() -> Self {
        Self {
            scan_range: 240.0,
            scan_fov_degrees: DEFAULT_SCAN_FOV_DEGREES,
            scan_max_results: DEFAULT_SCAN_MAX_RESULTS,
            harvest_distance: DEFAULT_HARVEST_DISTANCE,
            gather_amount: 1.0,
        }
    }
}

/// Where the engine reads the agent pose from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub movement_module: String,
    pub position_signal: String,
    pub orientation_signal: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            movement_module: MOVEMENT_MODULE.to_string(),
            position_signal: POSITION_SIGNAL.to_string(),
            orientation_signal: ORIENTATION_SIGNAL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub cargo_capacity: f32,
    /// Tool names by 1-based slot; empty strings are empty slots.
    pub tool_slots: Vec<String>,
    /// Storage box used by `storeDefault` and requests without a box id.
    pub default_box: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cargo_capacity: 30.0,
            tool_slots: vec!["axe".to_string(), "pickaxe".to_string()],
            default_box: "base".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read engine config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Resource, Debug, Clone)]
pub struct EngineConfigHandle(pub Arc<EngineConfig>);

impl EngineConfigHandle {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self(config)
    }

    pub fn get(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.0)
    }

    pub fn replace(&mut self, config: Arc<EngineConfig>) {
        self.0 = config;
    }
}

/// Loads the config named by `ROVER_ENGINE_CONFIG_PATH`, else the crate's data
/// file, else the builtin. Returns the path actually used, if any.
pub fn load_engine_config_from_env() -> (Arc<EngineConfig>, Option<PathBuf>) {
    let path = env::var(ENGINE_CONFIG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/data/engine_config.json"));

    match EngineConfig::from_file(&path) {
        Ok(config) => {
            tracing::info!(
                target: "rover::config",
                path = %path.display(),
                "engine_config.loaded=file"
            );
            return (Arc::new(config), Some(path));
        }
        Err(err) => {
            tracing::warn!(
                target: "rover::config",
                path = %path.display(),
                error = %err,
                "engine_config.load_failed"
            );
        }
    }

    tracing::info!(target: "rover::config", "engine_config.loaded=builtin");
    (EngineConfig::builtin(), None)
}
