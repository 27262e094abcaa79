//! Connection lifecycle and reconnection
//!
//! Both external dependencies, the field device and the durable store, are
//! owned by a [`ConnectionManager`] with its own [`ReconnectPolicy`], so a
//! fault in one never blocks the other.

pub mod connection;
pub mod reconnect;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, Connector};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
