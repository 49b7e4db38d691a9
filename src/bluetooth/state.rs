//! Observable connection state.
//!
//! The store holds the single published [`ConnectionState`] record. Only the
//! connection manager mutates status and device; UI collaborators read
//! snapshots, subscribe to changes, and may dismiss the error.

use parking_lot::Mutex;
use serde_json::json;
use strum::{Display, IntoStaticStr};
use tokio::sync::watch;

use crate::{bluetooth::transport::DeviceHandle, event::EventSender};

/// Lifecycle status of the robot link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Reconnecting,
}

impl ConnectionStatus {
   pub fn as_str(self) -> &'static str {
      self.into()
   }
}

/// The published connection record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionState {
   pub status: ConnectionStatus,
   pub device: Option<DeviceHandle>,
   pub error: Option<String>,
}

impl ConnectionState {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "status": self.status.as_str(),
          "device": self.device.as_ref().map(DeviceHandle::to_json),
          "error": self.error.as_deref(),
      })
   }
}

/// Shared, observable holder of the [`ConnectionState`].
pub struct StateStore {
   tx: watch::Sender<ConnectionState>,
   buses: Mutex<Vec<EventSender>>,
   publish_lock: Mutex<()>,
}

impl Default for StateStore {
   fn default() -> Self {
      Self::new()
   }
}

impl StateStore {
   pub fn new() -> Self {
      let (tx, _) = watch::channel(ConnectionState::default());
      Self {
         tx,
         buses: Mutex::new(Vec::new()),
         publish_lock: Mutex::new(()),
      }
   }

   /// Registers a bus that receives every subsequent publication.
   pub fn observe(&self, bus: EventSender) {
      self.buses.lock().push(bus);
   }

   pub fn snapshot(&self) -> ConnectionState {
      self.tx.borrow().clone()
   }

   /// Latest-value subscription; intermediate states may be coalesced.
   pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
      self.tx.subscribe()
   }

   /// Replaces the error without touching status or device.
   pub fn set_error(&self, error: Option<String>) {
      self.update(|state| state.error = error);
   }

   pub(super) fn publish(&self, state: ConnectionState) {
      self.update(|current| *current = state);
   }

   pub(super) fn reset(&self) {
      self.publish(ConnectionState::default());
   }

   fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
      let _guard = self.publish_lock.lock();
      self.tx.send_modify(f);
      let state = self.snapshot();
      let buses = self.buses.lock().clone();
      for bus in &buses {
         bus.emit(&state);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use bluer::Address;

   use super::*;
   use crate::bluetooth::testing::Recorder;

   #[test]
   fn test_initial_state_is_disconnected() {
      let store = StateStore::new();
      assert_eq!(store.snapshot(), ConnectionState {
         status: ConnectionStatus::Disconnected,
         device: None,
         error: None,
      });
   }

   #[test]
   fn test_set_error_keeps_status_and_device() {
      let store = StateStore::new();
      let device = DeviceHandle::new(Address([0xAA, 0xBB, 0xCC, 0, 0, 1]), None);
      store.publish(ConnectionState {
         status: ConnectionStatus::Connected,
         device: Some(device.clone()),
         error: Some("Failed to send command".into()),
      });

      store.set_error(None);

      let state = store.snapshot();
      assert_eq!(state.status, ConnectionStatus::Connected);
      assert_eq!(state.device, Some(device));
      assert!(state.error.is_none());
   }

   #[test]
   fn test_every_publication_reaches_buses_in_order() {
      let store = StateStore::new();
      let recorder = Arc::new(Recorder::default());
      store.observe(recorder.clone());

      store.publish(ConnectionState {
         status: ConnectionStatus::Connecting,
         ..Default::default()
      });
      store.set_error(Some("oops".into()));
      store.reset();

      assert_eq!(recorder.statuses(), [
         ConnectionStatus::Connecting,
         ConnectionStatus::Connecting,
         ConnectionStatus::Disconnected,
      ]);
      assert_eq!(recorder.history()[1].error.as_deref(), Some("oops"));
   }

   #[test]
   fn test_state_json_shape() {
      let state = ConnectionState {
         status: ConnectionStatus::Reconnecting,
         device: Some(DeviceHandle::new(
            Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            Some("RoboDog".into()),
         )),
         error: Some("Connection lost. Reconnecting...".into()),
      };

      let json = state.to_json();
      assert_eq!(json["status"], "reconnecting");
      assert_eq!(json["device"]["address"], "AA:BB:CC:DD:EE:FF");
      assert_eq!(json["device"]["name"], "RoboDog");
      assert_eq!(json["error"], "Connection lost. Reconnecting...");
   }
}
