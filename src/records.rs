//! Persistent record of the last connected robot using heed (LMDB).
//!
//! The record survives restarts so the daemon can reconnect to the robot
//! at startup without the user picking it again.

use std::{path::PathBuf, sync::Arc};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// Errors that can occur in device record operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create device record directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

const LAST_DEVICE_KEY: &str = "last_device";

/// The device the daemon last connected to successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
   pub address: SmolStr,
   pub name: Option<SmolStr>,
}

/// Durable get/set/clear storage for the last connected device.
pub trait DeviceRecords: Send + Sync {
   fn load(&self) -> Result<Option<StoredDevice>>;
   fn store(&self, record: &StoredDevice) -> Result<()>;
   fn clear(&self) -> Result<()>;
}

/// Database layout for device records
#[derive(Debug)]
struct Db {
   env: Env,
   /// Fixed key -> `StoredDevice`
   records: Database<Str, SerdeBincode<StoredDevice>>,
}

/// LMDB-backed [`DeviceRecords`].
#[derive(Clone, Debug)]
pub struct DeviceRecordDb {
   db: Arc<Db>,
}

impl DeviceRecordDb {
   /// Open or create the record database at the default location
   pub fn open() -> Result<Self> {
      Self::open_at(Self::db_path()?)
   }

   pub fn open_at(path: PathBuf) -> Result<Self> {
      std::fs::create_dir_all(&path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(&path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;

      let records = env
         .create_database(&mut wtxn, Some("records"))
         .map_err(Error::DatabaseOperation)?;

      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened device record database at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, records }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("ROBODOG_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/robodog-remote/device.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("robodog-remote").join("device.db"))
   }
}

impl DeviceRecords for DeviceRecordDb {
   fn load(&self) -> Result<Option<StoredDevice>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self
         .db
         .records
         .get(&rtxn, LAST_DEVICE_KEY)
         .map_err(Error::DatabaseOperation)
   }

   fn store(&self, record: &StoredDevice) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;

      self
         .db
         .records
         .put(&mut wtxn, LAST_DEVICE_KEY, record)
         .map_err(Error::DatabaseOperation)?;

      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   fn clear(&self) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;

      self
         .db
         .records
         .delete(&mut wtxn, LAST_DEVICE_KEY)
         .map_err(Error::DatabaseOperation)?;

      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }
}

/// Volatile [`DeviceRecords`], used when persistence is unavailable.
#[derive(Debug, Default)]
pub struct MemoryRecords {
   record: Mutex<Option<StoredDevice>>,
}

impl DeviceRecords for MemoryRecords {
   fn load(&self) -> Result<Option<StoredDevice>> {
      Ok(self.record.lock().clone())
   }

   fn store(&self, record: &StoredDevice) -> Result<()> {
      *self.record.lock() = Some(record.clone());
      Ok(())
   }

   fn clear(&self) -> Result<()> {
      *self.record.lock() = None;
      Ok(())
   }
}
