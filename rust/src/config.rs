//! Configuration loader. The file is JSON; the bot token can be kept out of it
//! with a `$ENV{VAR_NAME}` placeholder that is resolved at load time.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use zeroize::Zeroize;

use crate::engine::CustodySettings;
use crate::model::{ChannelId, RoleId};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "KEYBEARER_CONFIG";
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("environment variable {0} is required but missing")]
    MissingEnvVar(String),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Bot token. Never printed, wiped from memory on drop.
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn default_interval_hours() -> f64 {
    24.0
}

fn default_database_path() -> String {
    "database.json".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawKeybearerConfig {
    pub token: String,
    #[serde(default = "default_interval_hours")]
    pub transfer_interval_hours: f64,
    pub admin_role_id: RoleId,
    pub key_holder_role_id: RoleId,
    pub bot_log_channel_id: ChannelId,
    #[serde(default)]
    pub protected_channel_ids: Vec<ChannelId>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    pub debug_level: Option<String>,
    pub api_base_url: Option<String>,
}

#[derive(Debug)]
pub struct RuntimeConfig {
    pub token: Credential,
    pub transfer_interval: Duration,
    pub admin_role: RoleId,
    pub key_holder_role: RoleId,
    pub log_channel: ChannelId,
    pub protected_channels: Vec<ChannelId>,
    pub database_path: PathBuf,
    pub debug_level: Option<String>,
    pub api_base_url: String,
}

impl RuntimeConfig {
    pub fn custody_settings(&self) -> CustodySettings {
        CustodySettings {
            admin_role: self.admin_role,
            key_holder_role: self.key_holder_role,
            log_channel: self.log_channel,
            protected_channels: self.protected_channels.clone(),
        }
    }

    /// Printable view with the token redacted.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "transferIntervalHours": self.transfer_interval.as_secs_f64() / 3600.0,
            "adminRoleId": self.admin_role,
            "keyHolderRoleId": self.key_holder_role,
            "botLogChannelId": self.log_channel,
            "protectedChannelIds": self.protected_channels,
            "databasePath": self.database_path.display().to_string(),
            "debugLevel": self.debug_level,
            "apiBaseUrl": self.api_base_url,
            "token": "<redacted in output>"
        })
    }
}

/// Resolves a `$ENV{NAME}` placeholder; other values pass through unchanged.
fn expand_env_placeholder(text: String) -> Result<String, ConfigError> {
    let var = text
        .strip_prefix("$ENV{")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|inner| !inner.is_empty())
        .map(str::to_string);
    match var {
        Some(var) => std::env::var(&var).map_err(|_| ConfigError::MissingEnvVar(var)),
        None => Ok(text),
    }
}

/// Loads the JSON configuration file, resolves placeholders, and validates values.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let raw_json = fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    let raw: RawKeybearerConfig = serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))?;
    raw.into_runtime()
}

impl RawKeybearerConfig {
    pub fn into_runtime(self) -> Result<RuntimeConfig, ConfigError> {
        let token = Credential::new(expand_env_placeholder(self.token)?);
        if token.expose().trim().is_empty() {
            return Err(ConfigError::Invalid("token must not be empty".into()));
        }

        let hours = self.transfer_interval_hours;
        if !hours.is_finite() || hours <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "transferIntervalHours must be a positive number, got {hours}"
            )));
        }
        let transfer_interval = Duration::try_from_secs_f64(hours * 3600.0)
            .map_err(|e| ConfigError::Invalid(format!("transferIntervalHours out of range: {e}")))?;

        let database_path = PathBuf::from(expand_env_placeholder(self.database_path)?);
        let api_base_url = self
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(RuntimeConfig {
            token,
            transfer_interval,
            admin_role: self.admin_role_id,
            key_holder_role: self.key_holder_role_id,
            log_channel: self.bot_log_channel_id,
            protected_channels: self.protected_channel_ids,
            database_path,
            debug_level: self.debug_level,
            api_base_url,
        })
    }
}
