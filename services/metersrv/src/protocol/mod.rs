//! Field protocol access
//!
//! [`RegisterSource`] is the seam between the chunked reader and the wire:
//! production code reads through [`ModbusTcpClient`], tests through scripted
//! sources.

pub mod client;
pub mod constants;
pub mod pdu;

use async_trait::async_trait;

use crate::error::Result;

pub use client::{ModbusConnector, ModbusTcpClient};

/// Anything that can answer a Read Holding Registers request
#[async_trait]
pub trait RegisterSource: Send {
    /// Read `count` consecutive holding registers starting at `address`.
    ///
    /// Implementations may return fewer words than requested; the reader
    /// treats that as a failed read.
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;
}
