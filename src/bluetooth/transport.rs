//! Transport adapter abstraction.
//!
//! The connection manager only talks to the radio through [`Transport`],
//! which keeps the lifecycle logic independent of BlueZ.

use std::time::Duration;

use async_trait::async_trait;
use bluer::Address;
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::broadcast;

use crate::error::Result;

/// Line delimiter used by the robot firmware for both directions.
pub const LINE_DELIMITER: u8 = b'\n';

/// A remote endpoint as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
   pub address: Address,
   pub name: Option<SmolStr>,
}

impl DeviceHandle {
   pub const fn new(address: Address, name: Option<SmolStr>) -> Self {
      Self { address, name }
   }

   pub fn address_str(&self) -> SmolStr {
      self.address.to_smolstr()
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.address_str().as_str(),
          "name": self.name.as_deref(),
      })
   }
}

/// Byte-stream transport towards the robot.
///
/// Implementations must deliver an address on the
/// [`unsolicited_disconnects`](Transport::unsolicited_disconnects) channel
/// whenever a link drops without a matching [`disconnect`](Transport::disconnect)
/// call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
   async fn is_adapter_enabled(&self) -> Result<bool>;

   async fn paired_devices(&self) -> Result<Vec<DeviceHandle>>;

   /// Runs discovery for at most `duration` and returns what was seen.
   async fn discover(&self, duration: Duration) -> Result<Vec<DeviceHandle>>;

   async fn cancel_discovery(&self);

   /// Opens a newline-delimited link to `address`.
   async fn connect(&self, address: Address) -> Result<DeviceHandle>;

   async fn disconnect(&self, address: Address) -> Result<()>;

   async fn write(&self, address: Address, bytes: &[u8]) -> Result<()>;

   /// Subscribes to link drops. Dropping the receiver revokes the subscription.
   fn unsolicited_disconnects(&self) -> broadcast::Receiver<Address>;

   async fn active_connections(&self) -> Result<Vec<DeviceHandle>>;
}
