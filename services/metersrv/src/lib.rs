//! Meter Acquisition Service Library (metersrv)
//!
//! Polls metering devices over Modbus TCP (function code 0x03), decodes the
//! raw holding registers into scaled engineering values and disseminates each
//! result on two cadences: a live feed updated every cycle and a durable
//! SQLite archive written once per persistence interval.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Coordinator   │───►│  Chunked Reader │───►│  Decode/Scale   │
//! │ (poll interval) │    │ (≤ max_chunk)   │    │ (FieldLayout)   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                                              │
//!          ▼                                              ▼
//! ┌─────────────────┐                           ┌─────────────────┐
//! │ Transport Conn  │                           │   Sink Router   │──► LiveFeed (watch)
//! │    Manager      │                           │                 │──► SQLite (periodic)
//! └─────────────────┘                           └─────────────────┘
//!                                                         │
//!                                               ┌─────────────────┐
//!                                               │ Storage Conn    │
//!                                               │    Manager      │
//!                                               └─────────────────┘
//! ```
//!
//! Each device runs its own [`Coordinator`] with its own transport
//! [`ConnectionManager`] and [`SinkRouter`]; the storage manager is shared.
//! Read failures abort one cycle and reset the transport, storage outages only
//! skip durable writes, and neither stops the process.
//!
//! # Modules
//!
//! - **`layout`**: device endpoints, register blocks and the validated field table
//! - **`reader`**: chunked, all-or-nothing block reads
//! - **`decode`**: 16/32-bit register decoding and fixed-point scaling
//! - **`protocol`**: Modbus TCP framing and client
//! - **`runtime`**: connection managers and reconnect policy
//! - **`router`**: live snapshot plus periodic persistence
//! - **`storage`**: SQLite reading archive and range queries
//! - **`config`** / **`logging`**: figment configuration and tracing setup

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod layout;
pub mod logging;
pub mod protocol;
pub mod reader;
pub mod router;
pub mod runtime;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::MeterSrvConfig;
pub use coordinator::{Coordinator, CycleOutcome};
pub use error::{MeterSrvError, Result};
pub use layout::{DecodeKind, DeviceEndpoint, FieldDescriptor, FieldLayout, RegisterBlock};
pub use protocol::{ModbusConnector, ModbusTcpClient, RegisterSource};
pub use router::{LiveFeed, SinkRouter, SnapshotSink};
pub use runtime::{ConnectionManager, ConnectionState, Connector, ReconnectPolicy};
pub use snapshot::{DecodedSnapshot, FieldValue};
pub use storage::{ReadingDocument, ReadingStore, SqliteConnector, StorageManager};

/// Service name, also used for the log file name
pub const SERVICE_NAME: &str = "metersrv";

/// Service version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
