//! Robot discovery.
//!
//! Lists paired devices and runs a bounded discovery for new ones. Scan
//! failures are returned to the caller and never touch the connection state.

use std::{collections::HashSet, sync::Arc, time::Duration};

use log::{debug, info};
use serde_json::json;

use crate::{
   bluetooth::transport::{DeviceHandle, Transport},
   error::{RemoteError, Result},
};

/// Outcome of a scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanResult {
   pub paired: Vec<DeviceHandle>,
   /// Devices seen during discovery that are not paired yet
   pub discovered: Vec<DeviceHandle>,
}

impl ScanResult {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "paired": self.paired.iter().map(DeviceHandle::to_json).collect::<Vec<_>>(),
          "discovered": self.discovered.iter().map(DeviceHandle::to_json).collect::<Vec<_>>(),
      })
   }
}

pub struct Scanner {
   transport: Arc<dyn Transport>,
   permissions_granted: bool,
   timeout: Duration,
}

impl Scanner {
   pub fn new(transport: Arc<dyn Transport>, permissions_granted: bool, timeout: Duration) -> Self {
      Self {
         transport,
         permissions_granted,
         timeout,
      }
   }

   pub async fn scan(&self) -> Result<ScanResult> {
      if !self.permissions_granted {
         return Err(RemoteError::PermissionDenied);
      }
      if !self.transport.is_adapter_enabled().await? {
         return Err(RemoteError::AdapterDisabled);
      }

      let paired = self.transport.paired_devices().await?;
      debug!("{} paired devices", paired.len());

      let known: HashSet<_> = paired.iter().map(|d| d.address).collect();
      let discovered: Vec<_> = self
         .transport
         .discover(self.timeout)
         .await?
         .into_iter()
         .filter(|d| !known.contains(&d.address))
         .collect();

      info!(
         "Scan finished: {} paired, {} new",
         paired.len(),
         discovered.len()
      );
      Ok(ScanResult { paired, discovered })
   }

   pub async fn stop(&self) {
      self.transport.cancel_discovery().await;
   }
}
