//! Modbus TCP constants used by the register client
//!
//! Derived from the Modbus Application Protocol and Messaging on TCP/IP
//! specifications; only what FC03 polling needs is kept here.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length on the wire
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Protocol identifier carried in every MBAP header
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Standard Modbus TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03 (Read Holding Registers)
///
/// Response PDU: Function Code (1) + Byte Count (1) + N × 2 ≤ 253,
/// therefore N ≤ 125.
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

// ============================================================================
// Function Codes
// ============================================================================

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Human-readable name for a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
