//! Modbus PDU and MBAP framing
//!
//! PDUs use a fixed-size stack array; a TCP request is an MBAP header followed
//! by the PDU. Response parsing is strict: a response whose byte count does
//! not match the requested quantity is rejected rather than partially used.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::constants::{
    exception_description, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, MAX_MBAP_LENGTH,
    MAX_PDU_SIZE, MBAP_HEADER_LEN, MODBUS_MAX_READ_REGISTERS, MODBUS_PROTOCOL_ID,
};
use crate::error::{MeterSrvError, Result};

/// PDU backed by a stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(MeterSrvError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(MeterSrvError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        for byte in value.to_be_bytes() {
            self.push(byte)?;
        }
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Exception code of an exception response
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an FC03 request PDU
pub fn build_read_holding_registers(start_address: u16, quantity: u16) -> Result<ModbusPdu> {
    if quantity == 0 || quantity > MODBUS_MAX_READ_REGISTERS {
        return Err(MeterSrvError::protocol(format!(
            "Invalid register quantity {} (must be 1..={})",
            quantity, MODBUS_MAX_READ_REGISTERS
        )));
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(FC_READ_HOLDING_REGISTERS)?;
    pdu.push_u16(start_address)?;
    pdu.push_u16(quantity)?;
    Ok(pdu)
}

/// Parse an FC03 response PDU into exactly `expected_count` registers
pub fn parse_read_holding_registers(pdu: &ModbusPdu, expected_count: u16) -> Result<Vec<u16>> {
    let data = pdu.as_slice();

    if let Some(code) = pdu.exception_code() {
        return Err(MeterSrvError::protocol(format!(
            "Device returned exception {:02X} ({})",
            code,
            exception_description(code)
        )));
    }

    match pdu.function_code() {
        Some(FC_READ_HOLDING_REGISTERS) => {},
        Some(fc) => {
            return Err(MeterSrvError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                FC_READ_HOLDING_REGISTERS, fc
            )))
        },
        None => return Err(MeterSrvError::protocol("Empty PDU")),
    }

    if data.len() < 2 {
        return Err(MeterSrvError::protocol(format!(
            "PDU too short ({} bytes), cannot extract byte count",
            data.len()
        )));
    }

    let byte_count = usize::from(data[1]);
    let expected_bytes = usize::from(expected_count) * 2;
    if byte_count != expected_bytes {
        return Err(MeterSrvError::protocol(format!(
            "Byte count mismatch: expected {} bytes for {} registers, got {}",
            expected_bytes, expected_count, byte_count
        )));
    }
    if data.len() != 2 + byte_count {
        return Err(MeterSrvError::protocol(format!(
            "Incomplete PDU: declared {} data bytes, {} present",
            byte_count,
            data.len() - 2
        )));
    }

    let registers = data[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(registers)
}

// ============================================================================
// MBAP framing
// ============================================================================

/// Decoded MBAP header of a TCP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit ID + PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse and sanity-check the seven header bytes
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(MeterSrvError::protocol(format!(
                "Unexpected protocol id {}",
                header.protocol_id
            )));
        }
        let length = usize::from(header.length);
        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(MeterSrvError::protocol(format!(
                "Invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Number of PDU bytes that follow the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// Wrap a PDU in an MBAP header
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());

    debug!(
        "ADU built: tid={}, unit={}, bytes={:02X?}",
        transaction_id,
        unit_id,
        &frame[..]
    );
    frame.freeze()
}
