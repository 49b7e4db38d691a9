//! Error types for the remote-control daemon.
//!
//! This module defines all error types that can occur while driving the
//! robot link, including Bluetooth, D-Bus, I/O, storage and configuration
//! errors.

use bluer::Address;
use thiserror::Error;

/// Main error type for the remote-control daemon.
#[derive(Error, Debug)]
pub enum RemoteError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Storage error: {0}")]
   Storage(#[from] crate::records::Error),

   #[error("Bluetooth permissions not granted")]
   PermissionDenied,

   #[error("Bluetooth is not enabled")]
   AdapterDisabled,

   #[error("Failed to connect: {0}")]
   ConnectFailed(String),

   #[error("Failed to send command: {0}")]
   WriteFailed(String),

   #[error("Failed to disconnect: {0}")]
   DisconnectFailed(String),

   #[error("Failed to reconnect. Please reconnect manually.")]
   ReconnectExhausted,

   #[error("Connection attempt to {0} was cancelled")]
   ConnectCancelled(Address),

   #[error("Device not connected: {0}")]
   DeviceNotConnected(Address),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `RemoteError`.
pub type Result<T> = std::result::Result<T, RemoteError>;
