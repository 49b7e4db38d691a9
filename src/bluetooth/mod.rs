//! Bluetooth link layer for the robot.
//!
//! This module provides the RFCOMM transport, the observable connection
//! state store, device scanning and the connection lifecycle manager.

pub mod manager;
pub mod rfcomm;
pub mod scan;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
