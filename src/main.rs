//! Robot remote-control D-Bus service
//!
//! This service keeps a Bluetooth serial link to the robot alive and exposes
//! a D-Bus interface for the remote UI: connect, disconnect, command sending
//! and connection state changes.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   manager::ConnectionManager,
   rfcomm::RfcommTransport,
   scan::Scanner,
   state::{ConnectionState, StateStore},
};
use dbus::RemoteService;
use event::EventBus;
use records::{DeviceRecordDb, DeviceRecords, MemoryRecords};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod records;
mod robot;

use crate::{dbus::RemoteServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting robodog remote service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration (channel {}, auto-connect {})",
      config.rfcomm_channel, config.auto_connect
   );

   let records: Arc<dyn DeviceRecords> = match DeviceRecordDb::open() {
      Ok(db) => Arc::new(db),
      Err(e) => {
         warn!("Device records unavailable, last robot will not be remembered: {e}");
         Arc::new(MemoryRecords::default())
      },
   };

   // Obtaining a BlueZ session is the capability check
   let transport =
      Arc::new(RfcommTransport::new(config.adapter.as_deref(), config.rfcomm_channel).await?);

   // Create event channel
   let event_bus = EventProcessor::new();
   let store = Arc::new(StateStore::new());
   store.observe(event_bus.clone());

   let manager = ConnectionManager::new(
      transport.clone(),
      records,
      store,
      config.reconnect_policy(),
      true,
   );
   if config.auto_connect {
      manager.auto_connect().await;
   }

   let scanner = Scanner::new(transport, true, config.scan_timeout());

   // Create D-Bus service
   let service = RemoteService::new(manager.clone(), scanner);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("Robodog remote service started at {}", dbus::SERVICE_NAME);

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down robodog remote service...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<ConnectionState>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<ConnectionState> {
      loop {
         if let Some(state) = self.queue.pop() {
            return Some(state);
         }
         let notify = self.notifier.notified();
         if let Some(state) = self.queue.pop() {
            return Some(state);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<RemoteService>,
      state: ConnectionState,
   ) -> Result<()> {
      iface.state_changed(&state.to_json().to_string()).await?;

      let service = iface.get().await;
      let emitter = iface.signal_emitter();
      service.status_changed(emitter).await?;
      service.error_changed(emitter).await?;
      service.connected_address_changed(emitter).await?;
      service.reconnect_attempts_changed(emitter).await?;
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, RemoteService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(state) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, state).await {
               warn!("Error dispatching state change: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, state: &ConnectionState) {
      self.queue.push(state.clone());
      self.notifier.notify_waiters();
   }
}
