//! Scripted transport and recording bus shared by the link tests.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use bluer::Address;
use parking_lot::Mutex;
use tokio::{sync::broadcast, time};

use crate::{
   bluetooth::{
      state::{ConnectionState, ConnectionStatus},
      transport::{DeviceHandle, Transport},
   },
   error::{RemoteError, Result},
   event::EventBus,
};

pub const ROBOT: Address = Address([0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x01]);
pub const STRANGER: Address = Address([0x0A, 0x0B, 0x0C, 0x00, 0x00, 0x02]);

pub fn robot() -> DeviceHandle {
   DeviceHandle::new(ROBOT, Some("RoboDog".into()))
}

/// Records every publication it sees.
#[derive(Default)]
pub struct Recorder {
   history: Mutex<Vec<ConnectionState>>,
}

impl Recorder {
   pub fn history(&self) -> Vec<ConnectionState> {
      self.history.lock().clone()
   }

   pub fn statuses(&self) -> Vec<ConnectionStatus> {
      self.history.lock().iter().map(|s| s.status).collect()
   }
}

impl EventBus for Recorder {
   fn emit(&self, state: &ConnectionState) {
      self.history.lock().push(state.clone());
   }
}

/// In-memory [`Transport`] whose connect outcomes are scripted per call.
pub struct MockTransport {
   pub enabled: Mutex<bool>,
   /// Outcomes for upcoming `connect` calls; an empty script succeeds.
   pub connect_script: Mutex<VecDeque<bool>>,
   pub connect_latency: Mutex<Duration>,
   pub fail_writes: Mutex<bool>,
   pub fail_disconnects: Mutex<bool>,
   /// The next successful connect is dropped by the peer right away
   pub drop_next_connect: Mutex<bool>,
   pub paired: Mutex<Vec<DeviceHandle>>,
   pub nearby: Mutex<Vec<DeviceHandle>>,
   pub active: Mutex<Vec<DeviceHandle>>,
   pub connect_calls: Mutex<Vec<Address>>,
   pub disconnect_calls: Mutex<Vec<Address>>,
   pub writes: Mutex<Vec<(Address, Vec<u8>)>>,
   pub discovery_cancelled: Mutex<bool>,
   disconnects: broadcast::Sender<Address>,
}

impl Default for MockTransport {
   fn default() -> Self {
      let (disconnects, _) = broadcast::channel(16);
      Self {
         enabled: Mutex::new(true),
         connect_script: Mutex::default(),
         connect_latency: Mutex::new(Duration::ZERO),
         fail_writes: Mutex::new(false),
         fail_disconnects: Mutex::new(false),
         drop_next_connect: Mutex::new(false),
         paired: Mutex::default(),
         nearby: Mutex::default(),
         active: Mutex::default(),
         connect_calls: Mutex::default(),
         disconnect_calls: Mutex::default(),
         writes: Mutex::default(),
         discovery_cancelled: Mutex::new(false),
         disconnects,
      }
   }
}

impl MockTransport {
   pub fn script_connects(&self, outcomes: &[bool]) {
      self.connect_script.lock().extend(outcomes.iter().copied());
   }

   pub fn connect_count(&self) -> usize {
      self.connect_calls.lock().len()
   }

   /// Simulates the robot dropping the link.
   pub fn drop_link(&self, address: Address) {
      self.active.lock().retain(|d| d.address != address);
      let _ = self.disconnects.send(address);
   }
}

#[async_trait]
impl Transport for MockTransport {
   async fn is_adapter_enabled(&self) -> Result<bool> {
      Ok(*self.enabled.lock())
   }

   async fn paired_devices(&self) -> Result<Vec<DeviceHandle>> {
      Ok(self.paired.lock().clone())
   }

   async fn discover(&self, _duration: Duration) -> Result<Vec<DeviceHandle>> {
      Ok(self.nearby.lock().clone())
   }

   async fn cancel_discovery(&self) {
      *self.discovery_cancelled.lock() = true;
   }

   async fn connect(&self, address: Address) -> Result<DeviceHandle> {
      self.connect_calls.lock().push(address);
      let latency = *self.connect_latency.lock();
      if !latency.is_zero() {
         time::sleep(latency).await;
      }

      let succeed = self.connect_script.lock().pop_front().unwrap_or(true);
      if !succeed {
         return Err(RemoteError::ConnectFailed("Connection refused".into()));
      }

      let handle = DeviceHandle::new(address, Some("RoboDog".into()));
      self.active.lock().push(handle.clone());
      if std::mem::take(&mut *self.drop_next_connect.lock()) {
         self.drop_link(address);
      }
      Ok(handle)
   }

   async fn disconnect(&self, address: Address) -> Result<()> {
      self.disconnect_calls.lock().push(address);
      if *self.fail_disconnects.lock() {
         return Err(RemoteError::DisconnectFailed("Socket already closed".into()));
      }
      self.active.lock().retain(|d| d.address != address);
      Ok(())
   }

   async fn write(&self, address: Address, bytes: &[u8]) -> Result<()> {
      if *self.fail_writes.lock() {
         return Err(RemoteError::WriteFailed("Broken pipe".into()));
      }
      self.writes.lock().push((address, bytes.to_vec()));
      Ok(())
   }

   fn unsolicited_disconnects(&self) -> broadcast::Receiver<Address> {
      self.disconnects.subscribe()
   }

   async fn active_connections(&self) -> Result<Vec<DeviceHandle>> {
      Ok(self.active.lock().clone())
   }
}
