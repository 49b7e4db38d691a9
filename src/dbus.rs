use std::str::FromStr;

use bluer::Address;
use log::info;
use smol_str::SmolStr;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{manager::ConnectionManager, scan::Scanner, transport::DeviceHandle},
   robot::command::Control,
};

pub const SERVICE_NAME: &str = "org.robodog.Remote";
pub const OBJECT_PATH: &str = "/org/robodog/Remote";

pub struct RemoteService {
   manager: ConnectionManager,
   scanner: Scanner,
}

impl RemoteService {
   pub const fn new(manager: ConnectionManager, scanner: Scanner) -> Self {
      Self { manager, scanner }
   }
}

fn parse_control(control: &str) -> zbus::fdo::Result<Control> {
   Control::from_str(control)
      .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown control: {control}")))
}

#[interface(name = "org.robodog.Remote")]
impl RemoteService {
   async fn connect_device(&self, address: String, name: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      let name = (!name.is_empty()).then(|| SmolStr::from(name));

      self
         .manager
         .connect(DeviceHandle::new(addr, name))
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn disconnect_device(&self) -> bool {
      self.manager.disconnect().await;
      true
   }

   async fn send_command(&self, command: String) {
      self.manager.send(&command).await;
   }

   async fn press(&self, control: String) -> zbus::fdo::Result<()> {
      let control = parse_control(&control)?;
      self.manager.send(control.press().as_str()).await;
      Ok(())
   }

   async fn release(&self, control: String) -> zbus::fdo::Result<()> {
      let control = parse_control(&control)?;
      self.manager.send(control.release().as_str()).await;
      Ok(())
   }

   async fn dismiss_error(&self) {
      self.manager.store().set_error(None);
   }

   async fn get_state(&self) -> String {
      self.manager.state().to_json().to_string()
   }

   async fn scan(&self) -> zbus::fdo::Result<String> {
      let result = self
         .scanner
         .scan()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      info!(
         "Scan returned {} paired and {} new devices",
         result.paired.len(),
         result.discovered.len()
      );
      Ok(result.to_json().to_string())
   }

   async fn stop_scan(&self) {
      self.scanner.stop().await;
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn status(&self) -> String {
      self.manager.state().status.as_str().to_owned()
   }

   #[zbus(property)]
   async fn error(&self) -> String {
      self.manager.state().error.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connected_address(&self) -> String {
      self
         .manager
         .state()
         .device
         .map(|d| d.address_str().to_string())
         .unwrap_or_default()
   }

   #[zbus(property)]
   async fn reconnect_attempts(&self) -> u32 {
      self
         .manager
         .diagnostics()
         .await
         .map(|d| d.reconnect_attempts)
         .unwrap_or_default()
   }
}
