//! Event handling for connection state publications.
//!
//! Every publication of the connection state store is pushed to the
//! registered buses, in order, so observers such as the D-Bus signal
//! dispatcher see each intermediate transition.

use std::sync::Arc;

use crate::bluetooth::state::ConnectionState;

/// Trait for implementing state publication sinks.
pub trait EventBus: Send + Sync {
   /// Called once per publication with the freshly published state.
   fn emit(&self, state: &ConnectionState);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
