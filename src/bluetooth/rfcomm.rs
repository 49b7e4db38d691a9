//! RFCOMM transport towards the robot's serial port service.
//!
//! Every open link runs a receive task and a send task, like a classic
//! SPP socket split in two halves. Writes are queued and flushed in order.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, Session,
   rfcomm::{SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{
   io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
   select,
   sync::{Notify, broadcast, mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::transport::{DeviceHandle, LINE_DELIMITER, Transport},
   error::{RemoteError, Result},
};

pub type Packet = SmallVec<[u8; 32]>;

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pending disconnect notifications per subscriber
const DISCONNECT_BUFFER: usize = 16;

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// State of one open RFCOMM link.
struct Link {
   name: Option<SmolStr>,
   tx: mpsc::Sender<Command>,
   jset: JoinSet<()>,
}

impl Drop for Link {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

type Links = Arc<Mutex<HashMap<Address, Link>>>;

/// BlueZ-backed [`Transport`] speaking newline-delimited text over RFCOMM.
pub struct RfcommTransport {
   _session: Session,
   adapter: Adapter,
   channel: u8,
   links: Links,
   disconnects: broadcast::Sender<Address>,
   discovery_cancel: Notify,
}

impl RfcommTransport {
   pub async fn new(adapter_name: Option<&str>, channel: u8) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using adapter {} (RFCOMM channel {channel})", adapter.name());

      let (disconnects, _) = broadcast::channel(DISCONNECT_BUFFER);
      Ok(Self {
         _session: session,
         adapter,
         channel,
         links: Arc::default(),
         disconnects,
         discovery_cancel: Notify::new(),
      })
   }

   async fn device_name(&self, address: Address) -> Option<SmolStr> {
      let device = self.adapter.device(address).ok()?;
      device.name().await.ok().flatten().map(SmolStr::from)
   }
}

#[async_trait]
impl Transport for RfcommTransport {
   async fn is_adapter_enabled(&self) -> Result<bool> {
      Ok(self.adapter.is_powered().await?)
   }

   async fn paired_devices(&self) -> Result<Vec<DeviceHandle>> {
      let mut paired = Vec::new();
      for addr in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_paired().await.unwrap_or(false) {
            let name = device.name().await.ok().flatten().map(SmolStr::from);
            paired.push(DeviceHandle::new(addr, name));
         }
      }
      Ok(paired)
   }

   async fn discover(&self, duration: Duration) -> Result<Vec<DeviceHandle>> {
      let events = self.adapter.discover_devices().await?;
      tokio::pin!(events);

      let cancelled = self.discovery_cancel.notified();
      tokio::pin!(cancelled);
      let window = time::sleep(duration);
      tokio::pin!(window);

      let mut seen = HashSet::new();
      let mut found = Vec::new();
      loop {
         select! {
             () = &mut window => {
                 debug!("Discovery window elapsed");
                 break;
             }
             () = &mut cancelled => {
                 info!("Discovery cancelled");
                 break;
             }
             evt = events.next() => match evt {
                 Some(AdapterEvent::DeviceAdded(addr)) => {
                     if seen.insert(addr) {
                         let name = self.device_name(addr).await;
                         debug!("Discovered {addr} ({name:?})");
                         found.push(DeviceHandle::new(addr, name));
                     }
                 }
                 Some(_) => {}
                 None => break,
             }
         }
      }

      Ok(found)
   }

   async fn cancel_discovery(&self) {
      self.discovery_cancel.notify_waiters();
   }

   async fn connect(&self, address: Address) -> Result<DeviceHandle> {
      if let Some(link) = self.links.lock().get(&address) {
         return Ok(DeviceHandle::new(address, link.name.clone()));
      }

      debug!("Connecting to {address} channel {}", self.channel);
      let stream = time::timeout(
         CONNECT_TIMEOUT,
         Stream::connect(SocketAddr::new(address, self.channel)),
      )
      .await
      .map_err(|_| RemoteError::ConnectFailed(format!("{address} did not answer")))?
      .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;

      let name = self.device_name(address).await;
      let (reader, writer) = tokio::io::split(stream);
      let (cmd_tx, cmd_rx) = mpsc::channel(128);

      // Hold the map while spawning so an instant EOF still finds its link
      let mut links = self.links.lock();
      let mut jset = JoinSet::new();
      jset.spawn(recv_thread(
         address,
         reader,
         self.links.clone(),
         self.disconnects.clone(),
      ));
      jset.spawn(send_thread(address, cmd_rx, writer));
      links.insert(address, Link {
         name: name.clone(),
         tx: cmd_tx,
         jset,
      });
      drop(links);

      info!("RFCOMM link to {address} open");
      Ok(DeviceHandle::new(address, name))
   }

   async fn disconnect(&self, address: Address) -> Result<()> {
      let link = self.links.lock().remove(&address);
      if link.is_none() {
         return Err(RemoteError::DisconnectFailed(format!("no link to {address}")));
      }
      drop(link);
      info!("RFCOMM link to {address} closed");
      Ok(())
   }

   async fn write(&self, address: Address, bytes: &[u8]) -> Result<()> {
      let tx = self
         .links
         .lock()
         .get(&address)
         .map(|link| link.tx.clone())
         .ok_or(RemoteError::DeviceNotConnected(address))?;

      let (then, rx) = oneshot::channel();
      tx.send(Command::Send {
         data: Packet::from_slice(bytes),
         then,
      })
      .await
      .map_err(|_| RemoteError::DeviceNotConnected(address))?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| RemoteError::RequestTimeout)?
         .map_err(|_| RemoteError::DeviceNotConnected(address))?
   }

   fn unsolicited_disconnects(&self) -> broadcast::Receiver<Address> {
      self.disconnects.subscribe()
   }

   async fn active_connections(&self) -> Result<Vec<DeviceHandle>> {
      Ok(self
         .links
         .lock()
         .iter()
         .map(|(addr, link)| DeviceHandle::new(*addr, link.name.clone()))
         .collect())
   }
}

async fn recv_thread(
   adr: Address,
   reader: ReadHalf<Stream>,
   links: Links,
   disconnects: broadcast::Sender<Address>,
) {
   let mut lines = BufReader::new(reader).split(LINE_DELIMITER);
   loop {
      match lines.next_segment().await {
         Ok(Some(line)) => {
            debug!("← {adr}: {}", String::from_utf8_lossy(&line).trim_end());
         },
         Ok(None) => {
            warn!("Link to {adr} closed by peer");
            break;
         },
         Err(e) => {
            warn!("Read from {adr} failed: {e}");
            break;
         },
      }
   }

   // A link still in the map was not closed by us
   let lost = links.lock().remove(&adr);
   if lost.is_some() {
      let _ = disconnects.send(adr);
   }
   drop(lost);
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, mut writer: WriteHalf<Stream>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let written = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(e) = written {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(RemoteError::WriteFailed(e.to_string())));
            } else {
               let _ = then.send(Ok(()));
            }
         },
      }
   }
   let _ = writer.shutdown().await;
}
