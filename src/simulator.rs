//! # Device Simulator
//!
//! A Modbus device that answers requests from a [`ModbusRegisterBank`]. It
//! serves any async byte stream with TCP (MBAP) or RTU framing, so the same
//! device backs the integration tests (over `tokio::io::duplex`) and the
//! `device_simulator` binary (over a TCP listener).
//!
//! ## Exception Responses
//!
//! | Condition | Code |
//! |-----------|------|
//! | Function code not implemented | 0x01 Illegal Function |
//! | Address range outside the bank | 0x02 Illegal Data Address |
//! | Quantity, byte count or coil value invalid | 0x03 Illegal Data Value |
//! | Storage failure | 0x04 Server Device Failure |
//!
//! Frames addressed to another unit are ignored. Unit 0 is a broadcast:
//! writes are applied without a response, anything else is ignored.

use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, EXCEPTION_FLAG};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::transport::{
    decode_rtu_frame, encode_mbap_frame, encode_rtu_frame, frame_gap, read_rtu_frame, take_mbap_frame, Adu,
    ByteStream,
};
use crate::MAX_TCP_FRAME_SIZE;

/// Unit id that addresses every device on a line
pub const BROADCAST_UNIT_ID: SlaveId = 0;

/// Simulator statistics
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub exception_responses: u64,
    /// Frames dropped: wrong unit, bad CRC or undecodable
    pub ignored_frames: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Simulated Modbus device
///
/// Cloning is cheap and shares the register bank and statistics.
#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    unit_id: SlaveId,
    register_bank: Arc<ModbusRegisterBank>,
    response_delay: Duration,
    stats: Arc<Mutex<SimulatorStats>>,
}

impl DeviceSimulator {
    /// Create a device answering as `unit_id` from `register_bank`
    pub fn new(unit_id: SlaveId, register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            unit_id,
            register_bank,
            response_delay: Duration::ZERO,
            stats: Arc::new(Mutex::new(SimulatorStats::default())),
        }
    }

    /// Wait this long before answering each request
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }

    /// Register bank backing this device
    pub fn register_bank(&self) -> Arc<ModbusRegisterBank> {
        self.register_bank.clone()
    }

    pub async fn get_stats(&self) -> SimulatorStats {
        let mut stats = self.stats.lock().await.clone();
        stats.register_bank_stats = Some(self.register_bank.get_stats());
        stats
    }

    /// Answer one request PDU with a response or exception PDU
    pub fn process_pdu(&self, pdu: &[u8]) -> Vec<u8> {
        let function_code = pdu.first().copied().unwrap_or(0);

        let request = match codec::decode_request(pdu) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request for function 0x{:02X}: {}", function_code, e);
                return exception_pdu(function_code, exception_code_for(&e));
            },
        };

        match self.execute(&request) {
            Ok(response) => codec::encode_response(&response),
            Err(e) => {
                debug!("{} failed: {}", request.function(), e);
                exception_pdu(function_code, exception_code_for(&e))
            },
        }
    }

    fn execute(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let bank = &self.register_bank;

        let response = match request {
            ModbusRequest::ReadCoils { address, quantity } => {
                ModbusResponse::ReadCoils(bank.read_01(*address, *quantity)?)
            },
            ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                ModbusResponse::ReadDiscreteInputs(bank.read_02(*address, *quantity)?)
            },
            ModbusRequest::ReadHoldingRegisters { address, quantity } => {
                ModbusResponse::ReadHoldingRegisters(bank.read_03(*address, *quantity)?)
            },
            ModbusRequest::ReadInputRegisters { address, quantity } => {
                ModbusResponse::ReadInputRegisters(bank.read_04(*address, *quantity)?)
            },
            ModbusRequest::WriteSingleCoil { address, value } => {
                bank.write_05(*address, *value)?;
                ModbusResponse::WriteSingleCoil { address: *address, value: *value }
            },
            ModbusRequest::WriteSingleRegister { address, value } => {
                bank.write_06(*address, *value)?;
                ModbusResponse::WriteSingleRegister { address: *address, value: *value }
            },
            ModbusRequest::WriteMultipleCoils { address, values } => {
                bank.write_0f(*address, values)?;
                ModbusResponse::WriteMultipleCoils { address: *address, quantity: values.len() as u16 }
            },
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                bank.write_10(*address, values)?;
                ModbusResponse::WriteMultipleRegisters { address: *address, quantity: values.len() as u16 }
            },
            ModbusRequest::ReadWriteMultipleRegisters { read_address, read_quantity, write_address, values } => {
                ModbusResponse::ReadWriteMultipleRegisters(
                    bank.read_write_17(*read_address, *read_quantity, *write_address, values)?,
                )
            },
        };
        Ok(response)
    }

    /// Process one inbound ADU; `None` when no response is due
    async fn answer(&self, request: Adu) -> Option<Adu> {
        let broadcast = request.unit_id == BROADCAST_UNIT_ID;
        if !broadcast && request.unit_id != self.unit_id {
            debug!("Ignoring frame for unit {} (simulating unit {})", request.unit_id, self.unit_id);
            self.stats.lock().await.ignored_frames += 1;
            return None;
        }
        if broadcast && !is_broadcast_write(&request.pdu) {
            debug!("Ignoring broadcast that would need a reply");
            self.stats.lock().await.ignored_frames += 1;
            return None;
        }

        let pdu = self.process_pdu(&request.pdu);
        {
            let mut stats = self.stats.lock().await;
            stats.total_requests += 1;
            if pdu.first().is_some_and(|fc| fc & EXCEPTION_FLAG != 0) {
                stats.exception_responses += 1;
            }
        }

        if broadcast {
            return None;
        }
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }

        Some(Adu { transaction_id: request.transaction_id, unit_id: self.unit_id, pdu })
    }

    /// Serve MBAP-framed requests until the peer closes the stream
    ///
    /// A frame with an impossible MBAP header ends the session with
    /// `MalformedFrame`.
    pub async fn serve_tcp<S: ByteStream>(&self, mut stream: S) -> ModbusResult<()> {
        self.stats.lock().await.connections_count += 1;
        let mut buffer = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);

        loop {
            while let Some(request) = take_mbap_frame(&mut buffer)? {
                if let Some(response) = self.answer(request).await {
                    let frame = encode_mbap_frame(&response)?;
                    stream.write_all(&frame).await?;
                    stream.flush().await?;
                    self.stats.lock().await.bytes_sent += frame.len() as u64;
                }
            }

            buffer.reserve(MAX_TCP_FRAME_SIZE);
            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                debug!("TCP client closed the session");
                return Ok(());
            }
            self.stats.lock().await.bytes_received += n as u64;
        }
    }

    /// Serve RTU-framed requests until the stream closes
    ///
    /// Frames with a bad CRC are dropped without a response, as on a real
    /// serial line.
    pub async fn serve_rtu<S: ByteStream>(&self, mut stream: S, baud_rate: u32) -> ModbusResult<()> {
        self.stats.lock().await.connections_count += 1;
        let gap = frame_gap(baud_rate);

        loop {
            let frame = match read_rtu_frame(&mut stream, gap).await {
                Ok(frame) => frame,
                Err(ModbusError::ConnectionLost { .. }) => {
                    debug!("Serial stream closed");
                    return Ok(());
                },
                Err(e @ ModbusError::MalformedFrame { .. }) => {
                    warn!("Dropping RTU frame: {}", e);
                    self.stats.lock().await.ignored_frames += 1;
                    continue;
                },
                Err(e) => return Err(e),
            };
            self.stats.lock().await.bytes_received += frame.len() as u64;

            let request = match decode_rtu_frame(&frame) {
                Ok(adu) => adu,
                Err(e) => {
                    warn!("Dropping RTU frame: {}", e);
                    self.stats.lock().await.ignored_frames += 1;
                    continue;
                },
            };

            if let Some(response) = self.answer(request).await {
                let frame = encode_rtu_frame(response.unit_id, &response.pdu);
                tokio::time::sleep(gap).await;
                stream.write_all(&frame).await?;
                stream.flush().await?;
                self.stats.lock().await.bytes_sent += frame.len() as u64;
            }
        }
    }

    /// Accept TCP clients forever, one task per connection
    pub async fn listen(&self, listener: TcpListener) -> ModbusResult<()> {
        if let Ok(address) = listener.local_addr() {
            info!("Simulated unit {} listening on {}", self.unit_id, address);
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New client connected: {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }

                    let device = self.clone();
                    tokio::spawn(async move {
                        match device.serve_tcp(stream).await {
                            Ok(()) => info!("Client {} disconnected", peer),
                            Err(e) => warn!("Session with {} ended: {}", peer, e),
                        }
                    });
                },
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                },
            }
        }
    }
}

/// Only pure writes may be broadcast; 0x17 and reads always need a reply
fn is_broadcast_write(pdu: &[u8]) -> bool {
    pdu.first()
        .and_then(|&code| ModbusFunction::from_u8(code).ok())
        .is_some_and(|function| function.is_write_function() && !function.is_read_function())
}

fn exception_pdu(function_code: u8, exception_code: u8) -> Vec<u8> {
    vec![function_code | EXCEPTION_FLAG, exception_code]
}

fn exception_code_for(error: &ModbusError) -> u8 {
    match error {
        ModbusError::Unsupported { .. } => 0x01,
        ModbusError::Exception { code, .. } => *code,
        ModbusError::InvalidArgument { .. } | ModbusError::MalformedFrame { .. } => 0x03,
        _ => 0x04,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn device() -> DeviceSimulator {
        let bank = Arc::new(ModbusRegisterBank::with_size(1000));
        bank.write_10(0, &[10, 20, 30]).unwrap();
        DeviceSimulator::new(1, bank)
    }

    #[test]
    fn test_process_read_holding_registers() {
        let pdu = device().process_pdu(&[0x03, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(pdu, vec![0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E]);
    }

    #[test]
    fn test_process_exceptions() {
        let device = device();

        // Diagnostics is not implemented
        assert_eq!(device.process_pdu(&[0x08, 0x00, 0x00, 0x00, 0x00]), vec![0x88, 0x01]);
        assert_eq!(device.process_pdu(&[0x2B, 0x0E, 0x01, 0x00]), vec![0xAB, 0x01]);

        // Past the end of a 1000-address bank
        assert_eq!(device.process_pdu(&[0x03, 0x03, 0xE7, 0x00, 0x02]), vec![0x83, 0x02]);

        // Quantity 0 and a bad coil value
        assert_eq!(device.process_pdu(&[0x01, 0x00, 0x00, 0x00, 0x00]), vec![0x81, 0x03]);
        assert_eq!(device.process_pdu(&[0x05, 0x00, 0x01, 0x12, 0x34]), vec![0x85, 0x03]);
    }

    #[test]
    fn test_process_writes() {
        let device = device();
        let bank = device.register_bank();

        assert_eq!(device.process_pdu(&[0x05, 0x00, 0x05, 0xFF, 0x00]), vec![0x05, 0x00, 0x05, 0xFF, 0x00]);
        assert_eq!(bank.read_01(5, 1).unwrap(), vec![true]);

        let pdu = device.process_pdu(&[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(pdu, vec![0x10, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(bank.read_03(0, 3).unwrap(), vec![10, 0x000A, 0x0102]);
    }

    #[tokio::test]
    async fn test_serve_tcp_session() {
        let device = device();
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn({
            let device = device.clone();
            async move { device.serve_tcp(server).await }
        });

        // Request for unit 9 is ignored, then a read for unit 1
        client.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x00, 0x00, 0x01]).await.unwrap();
        client.write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).await.unwrap();

        let mut response = [0u8; 11];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x0A]);

        drop(client);
        task.await.unwrap().unwrap();

        let stats = device.get_stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.ignored_frames, 1);
    }

    #[tokio::test]
    async fn test_serve_tcp_rejects_bad_header() {
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move { device().serve_tcp(server).await });

        client.write_all(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(ModbusError::MalformedFrame { .. })));
    }

    #[tokio::test]
    async fn test_serve_rtu_session() {
        let device = device();
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn({
            let device = device.clone();
            async move { device.serve_rtu(server, 115200).await }
        });

        // Corrupted CRC: dropped silently
        client.write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.write_all(&encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x03])).await.unwrap();
        let mut response = [0u8; 11];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[..9], [0x01, 0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E]);
        assert_eq!(response[9..], [0x79, 0x78]);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(device.get_stats().await.ignored_frames, 1);
    }

    #[tokio::test]
    async fn test_broadcast_read_is_ignored() {
        let device = device();
        let request = Adu { transaction_id: None, unit_id: BROADCAST_UNIT_ID, pdu: vec![0x03, 0x00, 0x00, 0x00, 0x01] };

        assert_eq!(device.answer(request).await, None);
        let stats = device.get_stats().await;
        assert_eq!(stats.ignored_frames, 1);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn test_broadcast_applies_without_reply() {
        let device = device();
        let request = Adu { transaction_id: None, unit_id: BROADCAST_UNIT_ID, pdu: vec![0x06, 0x00, 0x07, 0x00, 0x2A] };

        assert_eq!(device.answer(request).await, None);
        assert_eq!(device.register_bank().read_03(7, 1).unwrap(), vec![42]);
    }
}
