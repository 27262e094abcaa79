//! Service configuration
//!
//! Loaded from a YAML file merged with `METERSRV_`-prefixed environment
//! variables (`__` separates nested keys, e.g. `METERSRV_LOGGING__LEVEL=debug`).
//! Everything is validated eagerly so a bad register table stops the service
//! at startup instead of surfacing as decode failures later.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{MeterSrvError, Result};
use crate::layout::{DeviceEndpoint, FieldDescriptor, FieldLayout, RegisterBlock};
use crate::protocol::constants::{DEFAULT_MODBUS_PORT, MODBUS_MAX_READ_REGISTERS};
use crate::runtime::{ReconnectConfig, ReconnectPolicy};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/metersrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "METERSRV_";

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterSrvConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    /// Register tables by model name
    pub profiles: BTreeMap<String, ProfileConfig>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: crate::SERVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Directory for daily-rolling log files; console only when unset
    pub dir: Option<PathBuf>,
    /// JSON console output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite archive file
    pub path: PathBuf,
    pub max_connections: u32,
    pub reconnect: ReconnectConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/metersrv.db"),
            max_connections: 4,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(&self.reconnect)
    }
}

/// Register blocks and fields shared by all devices of one model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub blocks: Vec<RegisterBlock>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl ProfileConfig {
    pub fn to_layout(&self) -> Result<FieldLayout> {
        FieldLayout::new(self.blocks.clone(), self.fields.clone())
    }
}

/// One polled device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Key into [`MeterSrvConfig::profiles`]
    pub profile: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
    #[serde(default = "default_max_chunk")]
    pub max_chunk: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_persist_interval_ms() -> u64 {
    120_000
}

fn default_max_chunk() -> u16 {
    20
}

fn default_timeout_ms() -> u64 {
    3000
}

impl DeviceConfig {
    pub fn endpoint(&self) -> Arc<DeviceEndpoint> {
        Arc::new(DeviceEndpoint {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(&self.reconnect)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| MeterSrvError::config(format!("device '{}': {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(MeterSrvError::config("device name cannot be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(fail("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(fail("port cannot be 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(fail("poll_interval_ms must be greater than 0".to_string()));
        }
        if self.persist_interval_ms == 0 {
            return Err(fail("persist_interval_ms must be greater than 0".to_string()));
        }
        if self.max_chunk == 0 || self.max_chunk > MODBUS_MAX_READ_REGISTERS {
            return Err(fail(format!(
                "max_chunk must be within 1..={}, got {}",
                MODBUS_MAX_READ_REGISTERS, self.max_chunk
            )));
        }
        if self.connect_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(fail("timeouts must be greater than 0".to_string()));
        }
        self.reconnect.validate().map_err(fail)?;
        Ok(())
    }
}

impl MeterSrvConfig {
    /// Load `path` merged with the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Check every section; register tables are checked via [`FieldLayout::new`]
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(MeterSrvError::config("service name cannot be empty"));
        }

        if self.storage.path.as_os_str().is_empty() {
            return Err(MeterSrvError::config("storage path cannot be empty"));
        }
        if self.storage.max_connections == 0 {
            return Err(MeterSrvError::config(
                "storage max_connections must be greater than 0",
            ));
        }
        self.storage
            .reconnect
            .validate()
            .map_err(|e| MeterSrvError::config(format!("storage: {e}")))?;

        for (name, profile) in &self.profiles {
            profile
                .to_layout()
                .map_err(|e| MeterSrvError::config(format!("profile '{name}': {e}")))?;
        }

        if self.devices.is_empty() {
            return Err(MeterSrvError::config("no devices configured"));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(MeterSrvError::config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            if !self.profiles.contains_key(&device.profile) {
                return Err(MeterSrvError::config(format!(
                    "device '{}' references unknown profile '{}'",
                    device.name, device.profile
                )));
            }
        }

        Ok(())
    }

    /// Validated layout for `device`'s profile
    pub fn layout_for(&self, device: &DeviceConfig) -> Result<Arc<FieldLayout>> {
        let profile = self.profiles.get(&device.profile).ok_or_else(|| {
            MeterSrvError::config(format!("unknown profile '{}'", device.profile))
        })?;
        Ok(Arc::new(profile.to_layout()?))
    }
}
