use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{FabricError, Result};

/// Target name reserved on the wire to mean "no target".
pub const RESERVED_TARGET_NAME: &str = "null";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_worker_port() -> u16 {
    7080
}

fn default_master_port() -> u16 {
    7081
}

fn default_reconnect_timeout() -> u64 {
    5
}

fn default_max_output_buffer() -> usize {
    1024 * 1024
}

fn default_table() -> String {
    "jobs".to_string()
}

fn default_fetch_limit() -> u32 {
    100
}

fn default_ping_interval() -> u64 {
    30
}

fn default_poke_throttle_interval() -> u64 {
    1
}

/// Worker daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Enables connection auth when set.
    pub password: Option<String>,
    #[serde(default)]
    pub always_allow_localhost: bool,
    /// Display name advertised to the master.
    pub name: Option<String>,
    /// No master link is established when absent.
    pub master_host: Option<String>,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    /// Seconds between reconnect attempts to the master.
    #[serde(default = "default_reconnect_timeout")]
    pub master_reconnect_timeout: u64,
    /// Per-stream cap on captured child output, in bytes.
    #[serde(default = "default_max_output_buffer")]
    pub max_output_buffer: usize,
    pub mysql: MysqlConfig,
    pub launcher: LauncherConfig,
    /// Target name to concurrency limit.
    #[serde(default)]
    pub targets: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Row cap per claim transaction. 0 disables the LIMIT clause.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    /// Command line template; the literal `{id}` is replaced with the job id
    /// and the result is split on whitespace.
    pub template: String,
    pub cwd: Option<PathBuf>,
    /// Environment additions for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Master daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_master_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub always_allow_localhost: bool,
    /// Seconds between keepalive pings to registered workers.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Throttle window for poke forwarding, in seconds.
    #[serde(default = "default_poke_throttle_interval")]
    pub poke_throttle_interval: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_master_port(),
            password: None,
            always_allow_localhost: false,
            ping_interval: default_ping_interval(),
            poke_throttle_interval: default_poke_throttle_interval(),
        }
    }
}

/// Validate a target name for configuration and `add-target`.
pub fn validate_target_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FabricError::Invalid("empty target name".to_string()));
    }
    if name == RESERVED_TARGET_NAME {
        return Err(FabricError::Invalid(format!(
            "target name '{RESERVED_TARGET_NAME}' is reserved"
        )));
    }
    Ok(())
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FabricError::Config(format!("{}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| FabricError::Config(format!("{}: {e}", path.display())))
}

impl WorkerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, concurrency) in &self.targets {
            validate_target_name(name).map_err(|e| FabricError::Config(e.to_string()))?;
            if *concurrency == 0 {
                return Err(FabricError::Config(format!(
                    "target '{name}': concurrency must be at least 1"
                )));
            }
        }
        if self.launcher.template.split_whitespace().next().is_none() {
            return Err(FabricError::Config("empty launcher template".to_string()));
        }
        Ok(())
    }
}

impl MasterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_toml(path.as_ref())
    }
}
