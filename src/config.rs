//! Configuration management for the remote-control daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including adapter selection and reconnection parameters.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Adapter to use, e.g. `hci0`. The system default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_auto_connect")]
   pub auto_connect: bool,

   #[serde(default = "default_max_reconnect_attempts")]
   pub max_reconnect_attempts: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_ms: u64,

   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_ms: u64,
}

/// Bounds of the automatic reconnection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
   pub max_attempts: u32,
   pub delay: Duration,
}

impl Default for ReconnectPolicy {
   fn default() -> Self {
      Self {
         max_attempts: default_max_reconnect_attempts(),
         delay: Duration::from_millis(default_reconnect_delay()),
      }
   }
}

const fn default_rfcomm_channel() -> u8 {
   1
}

const fn default_auto_connect() -> bool {
   true
}

const fn default_max_reconnect_attempts() -> u32 {
   3
}

const fn default_reconnect_delay() -> u64 {
   2000
}

const fn default_scan_timeout() -> u64 {
   15000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         rfcomm_channel: default_rfcomm_channel(),
         auto_connect: default_auto_connect(),
         max_reconnect_attempts: default_max_reconnect_attempts(),
         reconnect_delay_ms: default_reconnect_delay(),
         scan_timeout_ms: default_scan_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(robodog_home) = env::var("ROBODOG_HOME") {
         PathBuf::from(robodog_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(RemoteError::ConfigDirNotFound);
      };

      Ok(config_dir.join("robodog-remote").join("config.toml"))
   }

   pub const fn reconnect_policy(&self) -> ReconnectPolicy {
      ReconnectPolicy {
         max_attempts: self.max_reconnect_attempts,
         delay: Duration::from_millis(self.reconnect_delay_ms),
      }
   }

   pub const fn scan_timeout(&self) -> Duration {
      Duration::from_millis(self.scan_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_match_robot_firmware() {
      let config = Config::default();
      assert_eq!(config.rfcomm_channel, 1);
      assert!(config.auto_connect);
      assert_eq!(config.reconnect_policy(), ReconnectPolicy {
         max_attempts: 3,
         delay: Duration::from_millis(2000),
      });
      assert_eq!(config.scan_timeout(), Duration::from_secs(15));
   }

   #[test]
   fn test_partial_file_falls_back_to_defaults() {
      let config: Config = toml::from_str(
         r#"
            adapter = "hci1"
            reconnect_delay_ms = 500
         "#,
      )
      .unwrap();

      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.reconnect_policy().delay, Duration::from_millis(500));
      assert_eq!(config.max_reconnect_attempts, 3);
      assert_eq!(config.scan_timeout_ms, 15000);
   }

   #[test]
   fn test_round_trips_through_toml() {
      let config = Config {
         auto_connect: false,
         ..Default::default()
      };
      let text = toml::to_string_pretty(&config).unwrap();
      let parsed: Config = toml::from_str(&text).unwrap();
      assert!(!parsed.auto_connect);
      assert_eq!(parsed.rfcomm_channel, config.rfcomm_channel);
   }
}
