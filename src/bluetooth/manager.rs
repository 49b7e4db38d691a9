//! Connection lifecycle manager for the robot link.
//!
//! A single actor owns the link: it establishes connections, watches for
//! unsolicited drops, runs the bounded reconnection loop, persists the last
//! connected robot and is the only writer of the published connection state.

use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{broadcast, mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      state::{ConnectionState, ConnectionStatus, StateStore},
      transport::{DeviceHandle, LINE_DELIMITER, Transport},
   },
   config::ReconnectPolicy,
   error::{RemoteError, Result},
   records::{DeviceRecords, StoredDevice},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Published while the reconnection loop runs
const MSG_RECONNECTING: &str = "Connection lost. Reconnecting...";
/// Published when a command could not be written
const MSG_SEND_FAILED: &str = "Failed to send command";

/// Snapshot of the reconnection bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
   pub reconnect_attempts: u32,
   pub reconnecting: bool,
}

// === Commands ===

/// Who asked for a connection attempt, and where its outcome goes.
#[derive(Debug)]
enum Origin {
   User(oneshot::Sender<Result<()>>),
   Startup(oneshot::Sender<()>),
   Reconnect { attempt: u32 },
}

impl Origin {
   fn cancel(self, address: Address) {
      match self {
         Self::User(reply) => {
            let _ = reply.send(Err(RemoteError::ConnectCancelled(address)));
         },
         Self::Startup(reply) => {
            let _ = reply.send(());
         },
         Self::Reconnect { .. } => {},
      }
   }
}

#[derive(Debug)]
enum ManagerCommand {
   // User commands
   Connect(DeviceHandle, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<()>),
   Send(String, oneshot::Sender<()>),
   AutoConnect(oneshot::Sender<()>),
   Inspect(oneshot::Sender<Diagnostics>),
   Shutdown(oneshot::Sender<()>),

   // Loopback events
   ConnectFinished {
      epoch: u64,
      target: DeviceHandle,
      origin: Origin,
      result: Result<DeviceHandle>,
      events: broadcast::Receiver<Address>,
   },
   LinkLost(Address),
   ReconnectDue {
      epoch: u64,
      attempt: u32,
   },
}

// === Main Manager ===

/// Handle to the connection lifecycle actor.
///
/// This type is cheaply cloneable. The actor shuts down once every clone
/// has been dropped.
#[derive(Clone)]
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   store: Arc<StateStore>,
}

impl ConnectionManager {
   pub fn new(
      transport: Arc<dyn Transport>,
      records: Arc<dyn DeviceRecords>,
      store: Arc<StateStore>,
      policy: ReconnectPolicy,
      permissions_granted: bool,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(
         transport,
         records,
         store.clone(),
         policy,
         permissions_granted,
         command_rx,
      );
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         store,
      }
   }

   /// Read-only view of the published connection state.
   pub fn state(&self) -> ConnectionState {
      self.store.snapshot()
   }

   pub fn store(&self) -> &Arc<StateStore> {
      &self.store
   }

   /// Connects to `device`, resolving once the attempt has finished.
   ///
   /// Failures are also published to the state store; they are never retried.
   pub async fn connect(&self, device: DeviceHandle) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(device, tx))
         .await?
   }

   /// Tears down the link, forgets the stored robot and stops reconnecting.
   pub async fn disconnect(&self) {
      if let Err(e) = self.request(ManagerCommand::Disconnect).await {
         warn!("Disconnect request dropped: {e}");
      }
   }

   /// Writes `command` followed by the line delimiter to the active robot.
   ///
   /// A no-op when no robot is associated. Write failures only surface in the
   /// published error.
   pub async fn send(&self, command: &str) {
      let command = command.to_owned();
      if let Err(e) = self
         .request(|tx| ManagerCommand::Send(command, tx))
         .await
      {
         warn!("Send request dropped: {e}");
      }
   }

   /// Reconnects to the stored robot, if any. Failures are silent.
   pub async fn auto_connect(&self) {
      if let Err(e) = self.request(ManagerCommand::AutoConnect).await {
         warn!("Auto-connect request dropped: {e}");
      }
   }

   /// Closes the link for process exit. The stored robot is kept so the next
   /// start can reconnect to it.
   pub async fn shutdown(&self) {
      if let Err(e) = self.request(ManagerCommand::Shutdown).await {
         warn!("Shutdown request dropped: {e}");
      }
   }

   pub async fn diagnostics(&self) -> Result<Diagnostics> {
      self.request(ManagerCommand::Inspect).await
   }

   async fn request<T>(
      &self,
      command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| RemoteError::ManagerShutdown)?;
      rx.await.map_err(|_| RemoteError::ManagerShutdown)
   }
}

// === Manager Actor ===

struct ManagerActor {
   transport: Arc<dyn Transport>,
   records: Arc<dyn DeviceRecords>,
   store: Arc<StateStore>,
   policy: ReconnectPolicy,
   permissions_granted: bool,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   current: Option<DeviceHandle>,
   listener: Option<JoinHandle<()>>,
   pending: Option<Address>, // Target of the connect attempt in flight
   reconnect_target: Option<DeviceHandle>,
   reconnect_attempts: u32,
   reconnecting: bool,
   epoch: u64, // Bumped by every explicit connect/disconnect; stale timers compare against it
}

impl ManagerActor {
   fn new(
      transport: Arc<dyn Transport>,
      records: Arc<dyn DeviceRecords>,
      store: Arc<StateStore>,
      policy: ReconnectPolicy,
      permissions_granted: bool,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         transport,
         records,
         store,
         policy,
         permissions_granted,
         command_rx,
         loopback_rx,
         loopback_tx,
         current: None,
         listener: None,
         pending: None,
         reconnect_target: None,
         reconnect_attempts: 0,
         reconnecting: false,
         epoch: 0,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(device, reply) => {
            self.handle_connect(device, reply).await;
         },
         ManagerCommand::Disconnect(reply) => {
            self.handle_disconnect().await;
            let _ = reply.send(());
         },
         ManagerCommand::Send(command, reply) => {
            self.handle_send(&command).await;
            let _ = reply.send(());
         },
         ManagerCommand::AutoConnect(reply) => {
            self.handle_auto_connect(reply).await;
         },
         ManagerCommand::Inspect(reply) => {
            let _ = reply.send(Diagnostics {
               reconnect_attempts: self.reconnect_attempts,
               reconnecting: self.reconnecting,
            });
         },
         ManagerCommand::Shutdown(reply) => {
            self.handle_shutdown().await;
            let _ = reply.send(());
         },
         ManagerCommand::ConnectFinished {
            epoch,
            target,
            origin,
            result,
            events,
         } => {
            self.handle_connect_finished(epoch, target, origin, result, events)
               .await;
         },
         ManagerCommand::LinkLost(addr) => {
            self.handle_link_lost(addr);
         },
         ManagerCommand::ReconnectDue { epoch, attempt } => {
            self.handle_reconnect_due(epoch, attempt);
         },
      }
   }

   async fn check_capabilities(&self) -> Result<()> {
      if !self.permissions_granted {
         return Err(RemoteError::PermissionDenied);
      }
      match self.transport.is_adapter_enabled().await {
         Ok(true) => Ok(()),
         Ok(false) => Err(RemoteError::AdapterDisabled),
         Err(e) => {
            warn!("Failed to query adapter state: {e}");
            Err(RemoteError::AdapterDisabled)
         },
      }
   }

   /// Starts a fresh session: new epoch, full retry budget.
   fn begin_session(&mut self) {
      self.epoch += 1;
      self.reconnect_attempts = 0;
      self.reconnecting = false;
      self.reconnect_target = None;
   }

   async fn handle_connect(&mut self, device: DeviceHandle, reply: oneshot::Sender<Result<()>>) {
      if let Err(e) = self.check_capabilities().await {
         warn!("Refusing to connect to {}: {e}", device.address);
         self.store.set_error(Some(e.to_string()));
         let _ = reply.send(Err(e));
         return;
      }

      info!("Connecting to {}", device.address);
      self.begin_session();
      let previous = self
         .current
         .as_ref()
         .map(|d| d.address)
         .filter(|addr| *addr != device.address);
      self.release_current();
      if let Some(addr) = previous {
         info!("Closing link to {addr} before switching robots");
         if let Err(e) = self.transport.disconnect(addr).await {
            debug!("Ignoring failure closing link to {addr}: {e}");
         }
      }

      let device_shown = self.store.snapshot().device;
      self.store.publish(ConnectionState {
         status: ConnectionStatus::Connecting,
         device: device_shown,
         error: None,
      });

      self.spawn_connect(device, Origin::User(reply));
   }

   async fn handle_auto_connect(&mut self, reply: oneshot::Sender<()>) {
      if self.current.is_some() || self.pending.is_some() {
         debug!("Link already in use, skipping auto-connect");
         let _ = reply.send(());
         return;
      }

      let record = match self.records.load() {
         Ok(Some(record)) => record,
         Ok(None) => {
            debug!("No stored robot, skipping auto-connect");
            let _ = reply.send(());
            return;
         },
         Err(e) => {
            warn!("Failed to load stored robot: {e}");
            let _ = reply.send(());
            return;
         },
      };

      let Ok(address) = Address::from_str(&record.address) else {
         warn!("Stored robot address {:?} is invalid", record.address);
         let _ = reply.send(());
         return;
      };

      if let Err(e) = self.check_capabilities().await {
         info!("Skipping auto-connect to {address}: {e}");
         let _ = reply.send(());
         return;
      }

      let target = DeviceHandle::new(address, record.name);

      let active = self
         .transport
         .active_connections()
         .await
         .unwrap_or_else(|e| {
            warn!("Failed to list active connections: {e}");
            Vec::new()
         });

      if let Some(handle) = active.into_iter().find(|d| d.address == address) {
         info!("Adopting existing link to {address}");
         self.begin_session();
         let events = self.transport.unsolicited_disconnects();
         self.establish(keep_name(handle, &target), events, false);
         let _ = reply.send(());
         return;
      }

      info!("Auto-connecting to stored robot {address}");
      self.begin_session();
      self.store.publish(ConnectionState {
         status: ConnectionStatus::Connecting,
         device: None,
         error: None,
      });
      self.spawn_connect(target, Origin::Startup(reply));
   }

   fn spawn_connect(&mut self, target: DeviceHandle, origin: Origin) {
      self.pending = Some(target.address);

      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let epoch = self.epoch;
      // Must exist before connect returns: the peer may hang up right after accepting
      let events = self.transport.unsolicited_disconnects();

      tokio::spawn(async move {
         let result = transport.connect(target.address).await;
         if let Err(e) = loopback
            .send(ManagerCommand::ConnectFinished {
               epoch,
               target,
               origin,
               result,
               events,
            })
            .await
         {
            warn!("Channel overflow sending connect result: {e}");
         }
      });
   }

   async fn handle_connect_finished(
      &mut self,
      epoch: u64,
      target: DeviceHandle,
      origin: Origin,
      result: Result<DeviceHandle>,
      events: broadcast::Receiver<Address>,
   ) {
      let live = match &origin {
         Origin::Reconnect { attempt } => self.is_live_attempt(epoch, *attempt),
         Origin::User(_) | Origin::Startup(_) => epoch == self.epoch,
      };
      if !live {
         debug!("Discarding superseded connect result for {}", target.address);
         self.discard_stale(result).await;
         origin.cancel(target.address);
         return;
      }

      self.pending = None;
      let result = result.map(|handle| keep_name(handle, &target));

      match origin {
         Origin::User(reply) => match result {
            Ok(handle) => {
               self.establish(handle, events, true);
               let _ = reply.send(Ok(()));
            },
            Err(e) => {
               warn!("Failed to connect to {}: {e}", target.address);
               self.store.publish(ConnectionState {
                  status: ConnectionStatus::Disconnected,
                  device: None,
                  error: Some(e.to_string()),
               });
               let _ = reply.send(Err(e));
            },
         },
         Origin::Startup(reply) => {
            match result {
               Ok(handle) => self.establish(handle, events, true),
               Err(e) => {
                  warn!("Auto-connect to {} failed: {e}", target.address);
                  self.store.publish(ConnectionState::default());
               },
            }
            let _ = reply.send(());
         },
         Origin::Reconnect { attempt } => match result {
            Ok(handle) => {
               info!("Reconnected to {} on attempt {attempt}", handle.address);
               self.reconnecting = false;
               self.reconnect_target = None;
               self.establish(handle, events, true);
            },
            Err(e) if self.reconnect_attempts < self.policy.max_attempts => {
               warn!("Reconnect attempt {attempt} to {} failed: {e}", target.address);
               self.schedule_reconnect();
            },
            Err(e) => {
               warn!(
                  "Giving up on {} after {attempt} reconnect attempts: {e}",
                  target.address
               );
               self.reconnecting = false;
               self.reconnect_target = None;
               self.store.publish(ConnectionState {
                  status: ConnectionStatus::Disconnected,
                  device: None,
                  error: Some(RemoteError::ReconnectExhausted.to_string()),
               });
            },
         },
      }
   }

   /// Closes a link that was opened for an attempt nobody waits for anymore.
   async fn discard_stale(&self, result: Result<DeviceHandle>) {
      let Ok(handle) = result else {
         return;
      };
      let in_use = self.current.as_ref().is_some_and(|d| d.address == handle.address)
         || self.pending == Some(handle.address);
      if in_use {
         return;
      }
      if let Err(e) = self.transport.disconnect(handle.address).await {
         debug!("Ignoring failure closing stale link to {}: {e}", handle.address);
      }
   }

   /// Associates `handle` with the session and publishes `Connected`.
   fn establish(
      &mut self,
      handle: DeviceHandle,
      events: broadcast::Receiver<Address>,
      persist: bool,
   ) {
      info!("Connected to {}", handle.address);
      self.current = Some(handle.clone());
      self.install_listener(handle.address, events);
      if persist {
         self.persist(&handle);
      }
      self.store.publish(ConnectionState {
         status: ConnectionStatus::Connected,
         device: Some(handle),
         error: None,
      });
   }

   fn persist(&self, handle: &DeviceHandle) {
      let record = StoredDevice {
         address: handle.address_str(),
         name: handle.name.clone(),
      };
      if let Err(e) = self.records.store(&record) {
         warn!("Failed to persist robot {}: {e}", handle.address);
      }
   }

   fn install_listener(&mut self, address: Address, mut events: broadcast::Receiver<Address>) {
      self.revoke_listener();

      let loopback = self.loopback_tx.clone();

      self.listener = Some(tokio::spawn(async move {
         loop {
            match events.recv().await {
               Ok(addr) if addr == address => {
                  if let Err(e) = loopback.send(ManagerCommand::LinkLost(addr)).await {
                     warn!("Channel overflow sending link lost: {e}");
                     return;
                  }
               },
               Ok(addr) => {
                  debug!("Ignoring disconnect of {addr} while watching {address}");
               },
               Err(broadcast::error::RecvError::Lagged(n)) => {
                  warn!("Missed {n} disconnect events for {address}");
               },
               Err(broadcast::error::RecvError::Closed) => return,
            }
         }
      }));
   }

   fn revoke_listener(&mut self) {
      if let Some(handle) = self.listener.take() {
         handle.abort();
      }
   }

   fn release_current(&mut self) {
      self.revoke_listener();
      self.current = None;
   }

   fn handle_link_lost(&mut self, address: Address) {
      let Some(device) = self.current.take_if(|d| d.address == address) else {
         debug!("Ignoring disconnect of {address}: not the active robot");
         return;
      };

      warn!("Link to {address} lost");
      self.revoke_listener();

      let error = self.store.snapshot().error;
      self.store.publish(ConnectionState {
         status: ConnectionStatus::Disconnected,
         device: None,
         error,
      });

      if self.reconnecting {
         debug!("Reconnection to {address} already in flight");
         return;
      }
      if self.reconnect_attempts >= self.policy.max_attempts {
         info!("Not reconnecting to {address}: retry budget exhausted");
         return;
      }

      self.reconnecting = true;
      self.reconnect_target = Some(device);
      self.schedule_reconnect();
   }

   fn schedule_reconnect(&mut self) {
      self.reconnect_attempts += 1;
      let attempt = self.reconnect_attempts;
      let delay = self.policy.delay;
      info!(
         "Reconnecting (attempt {attempt}/{}) in {delay:?}",
         self.policy.max_attempts
      );

      self.store.publish(ConnectionState {
         status: ConnectionStatus::Reconnecting,
         device: None,
         error: Some(MSG_RECONNECTING.into()),
      });

      let loopback = self.loopback_tx.clone();
      let epoch = self.epoch;
      tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback
            .send(ManagerCommand::ReconnectDue { epoch, attempt })
            .await;
      });
   }

   fn is_live_attempt(&self, epoch: u64, attempt: u32) -> bool {
      epoch == self.epoch && self.reconnecting && attempt == self.reconnect_attempts
   }

   fn handle_reconnect_due(&mut self, epoch: u64, attempt: u32) {
      if !self.is_live_attempt(epoch, attempt) {
         debug!("Dropping stale reconnect timer for attempt {attempt}");
         return;
      }
      let Some(target) = self.reconnect_target.clone() else {
         return;
      };
      self.spawn_connect(target, Origin::Reconnect { attempt });
   }

   async fn handle_disconnect(&mut self) {
      info!("Disconnecting on user request");
      self.end_session();
      self.close_current().await;

      if let Err(e) = self.records.clear() {
         warn!("Failed to clear stored robot: {e}");
      }

      self.store.reset();
   }

   async fn handle_shutdown(&mut self) {
      info!("Closing robot link for shutdown");
      self.end_session();
      self.close_current().await;
      self.store.reset();
   }

   /// Pre-empts the reconnection loop before anything can race in.
   fn end_session(&mut self) {
      self.epoch += 1;
      self.reconnect_attempts = self.policy.max_attempts;
      self.reconnecting = false;
      self.reconnect_target = None;
      self.pending = None;
   }

   async fn handle_send(&mut self, command: &str) {
      let Some(address) = self.current.as_ref().map(|d| d.address) else {
         debug!("Dropping command {command:?}: no robot connected");
         return;
      };

      let mut frame = Vec::with_capacity(command.len() + 1);
      frame.extend_from_slice(command.as_bytes());
      frame.push(LINE_DELIMITER);

      if let Err(e) = self.transport.write(address, &frame).await {
         warn!("Failed to send {command:?} to {address}: {e}");
         self.store.set_error(Some(MSG_SEND_FAILED.into()));
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connection manager");
      self.close_current().await;
   }

   /// Revokes the listener and closes the current link, ignoring failures.
   async fn close_current(&mut self) {
      self.revoke_listener();
      if let Some(device) = self.current.take()
         && let Err(e) = self.transport.disconnect(device.address).await
      {
         warn!("Ignoring teardown failure for {}: {e}", device.address);
      }
   }
}

/// Prefers the transport's name, falling back to the one the caller supplied.
fn keep_name(handle: DeviceHandle, target: &DeviceHandle) -> DeviceHandle {
   DeviceHandle {
      name: handle.name.or_else(|| target.name.clone()),
      ..handle
   }
}
