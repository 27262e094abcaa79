//! Modbus TCP register client
//!
//! One request in flight at a time: the client writes an FC03 frame, then
//! reads exactly one MBAP header plus its PDU under the response timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::constants::MBAP_HEADER_LEN;
use super::pdu::{
    build_read_holding_registers, encode_adu, parse_read_holding_registers, MbapHeader, ModbusPdu,
};
use super::RegisterSource;
use crate::error::{MeterSrvError, Result};
use crate::layout::DeviceEndpoint;
use crate::runtime::Connector;

/// Connected Modbus TCP client bound to one unit id
#[derive(Debug)]
pub struct ModbusTcpClient {
    stream: TcpStream,
    unit_id: u8,
    response_timeout: Duration,
    transaction_id: u16,
}

impl ModbusTcpClient {
    /// Open a TCP connection to `endpoint`, bounded by `connect_timeout`
    pub async fn connect(
        endpoint: &DeviceEndpoint,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let addr = endpoint.address();
        debug!("TCP connecting: {}", addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                return Err(MeterSrvError::connection(format!(
                    "Failed to connect to {addr}: {e}"
                )));
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                return Err(MeterSrvError::connection(format!(
                    "Connection to {addr} timed out after {}ms",
                    connect_timeout.as_millis()
                )));
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        info!("TCP connected: {} (unit {})", addr, endpoint.unit_id);

        Ok(Self {
            stream,
            unit_id: endpoint.unit_id,
            response_timeout,
            transaction_id: 0,
        })
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Send one request PDU and return the matching response PDU
    async fn request(&mut self, pdu: &ModbusPdu) -> Result<ModbusPdu> {
        let transaction_id = self.next_transaction_id();
        let frame = encode_adu(transaction_id, self.unit_id, pdu);

        self.stream.write_all(&frame).await.map_err(|e| {
            error!("TCP TX: {}", e);
            MeterSrvError::IoError(format!("TCP send error: {e}"))
        })?;

        let response = timeout(self.response_timeout, self.receive()).await.map_err(|_| {
            debug!("TCP response timeout (tid={})", transaction_id);
            MeterSrvError::timeout(format!(
                "No response within {}ms",
                self.response_timeout.as_millis()
            ))
        })??;

        let (header, pdu) = response;
        if header.transaction_id != transaction_id {
            return Err(MeterSrvError::protocol(format!(
                "Transaction id mismatch: sent {}, received {}",
                transaction_id, header.transaction_id
            )));
        }
        if header.unit_id != self.unit_id {
            return Err(MeterSrvError::protocol(format!(
                "Unit id mismatch: expected {}, received {}",
                self.unit_id, header.unit_id
            )));
        }
        Ok(pdu)
    }

    /// Read one complete MBAP frame
    async fn receive(&mut self) -> Result<(MbapHeader, ModbusPdu)> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        self.stream.read_exact(&mut header).await.map_err(|e| {
            error!("TCP header RX: {}", e);
            MeterSrvError::IoError(format!("TCP header read error: {e}"))
        })?;
        let header = MbapHeader::parse(&header)?;

        let mut body = vec![0u8; header.pdu_len()];
        self.stream.read_exact(&mut body).await.map_err(|e| {
            error!("TCP PDU RX: {}", e);
            MeterSrvError::IoError(format!("TCP PDU read error: {e}"))
        })?;
        debug!("TCP RX: {}B", MBAP_HEADER_LEN + body.len());

        Ok((header, ModbusPdu::from_slice(&body)?))
    }
}

#[async_trait]
impl RegisterSource for ModbusTcpClient {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let request = build_read_holding_registers(address, count)?;
        let response = self.request(&request).await?;
        parse_read_holding_registers(&response, count)
    }
}

/// Opens [`ModbusTcpClient`]s for one device on behalf of a connection manager
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    endpoint: Arc<DeviceEndpoint>,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl ModbusConnector {
    pub fn new(
        endpoint: Arc<DeviceEndpoint>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            connect_timeout,
            response_timeout,
        }
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    type Connection = ModbusTcpClient;

    fn target(&self) -> String {
        format!("modbus://{}", self.endpoint.address())
    }

    async fn connect(&self) -> Result<ModbusTcpClient> {
        ModbusTcpClient::connect(&self.endpoint, self.connect_timeout, self.response_timeout).await
    }
}
