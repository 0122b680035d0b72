//! # Modbus Transport Layer
//!
//! This module moves Application Data Units (ADUs) over an async byte
//! stream, adding and stripping the transport framing around a PDU.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - 7-byte MBAP header: transaction id, protocol id (0), length, unit id
//! - Frames reassembled from a read buffer, so partial reads and cancelled
//!   reads never lose bytes
//! - Reconnects to the remembered address
//!
//! ### Modbus RTU (`RtuTransport`)
//! - Serial port communication (RS-232, RS-485)
//! - CRC-16 validation for message integrity
//! - Frames delimited by 3.5 character times of line silence
//!
//! Both transports can be built over any `AsyncRead + AsyncWrite` stream
//! (`from_stream`), which is how tests and the device simulator drive them.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_engine::transport::{Adu, ModbusTransport, TcpTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::connect("127.0.0.1:502", Duration::from_secs(5)).await?;
//!
//!     // Read holding registers 0..10 from unit 1
//!     let request = Adu { transaction_id: Some(1), unit_id: 1, pdu: vec![0x03, 0x00, 0x00, 0x00, 0x0A] };
//!     transport.send(&request).await?;
//!     let response = transport.receive(Duration::from_secs(1)).await?;
//!     println!("Response PDU: {:02X?}", response.pdu);
//!
//!     let stats = transport.get_stats();
//!     println!("Bytes sent: {}, received: {}", stats.bytes_sent, stats.bytes_received);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::{MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE};

/// Modbus TCP Application Protocol header size (including unit id)
pub const MBAP_HEADER_SIZE: usize = 7;

/// Smallest RTU frame: unit id, function code, two CRC bytes
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// Fixed inter-frame silence used above 19200 baud
pub const HIGH_BAUD_FRAME_GAP: Duration = Duration::from_micros(1750);

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Log packet with direction and format
fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<u8>) {
    let hex_string = crate::utils::format::bytes_to_hex(data);
    match unit_id {
        Some(id) => info!("[MODBUS-{}] {} unit:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Any bidirectional async byte stream a transport can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Which framing a transport applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// MBAP framing; responses correlate by transaction id
    Tcp,
    /// Serial framing; one outstanding request per line, no transaction id
    Rtu,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Rtu => write!(f, "RTU"),
        }
    }
}

/// Application Data Unit: a PDU plus the addressing its framing carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// MBAP transaction id; `None` on serial lines
    pub transaction_id: Option<u16>,
    pub unit_id: SlaveId,
    pub pdu: Vec<u8>,
}

/// Transport layer abstraction for Modbus communication protocols
///
/// A transport only frames and moves bytes. Correlating responses with
/// requests, deadlines across retries and the busy rule belong to
/// [`crate::connection::Connection`].
///
/// ## Error Handling
///
/// - `Timeout` when no complete frame arrives within the given time
/// - `ConnectionLost` when the peer closes the stream (EOF)
/// - `Transport` for other I/O failures
/// - `MalformedFrame` / `CrcMismatch` when a frame fails validation
#[async_trait]
pub trait ModbusTransport: Send {
    /// Framing applied by this transport
    fn kind(&self) -> TransportKind;

    /// Frame and transmit one ADU
    async fn send(&mut self, adu: &Adu) -> ModbusResult<()>;

    /// Wait up to `timeout` for one complete inbound frame
    async fn receive(&mut self, timeout: Duration) -> ModbusResult<Adu>;

    /// Drop input left over from abandoned transactions
    ///
    /// A non-zero `late_window` means a response is still owed: wait up to
    /// that long for it to start arriving, then drain it. Returns the number
    /// of bytes or frames discarded, 0 when nothing came.
    async fn discard_input(&mut self, late_window: Duration) -> ModbusResult<usize>;

    /// Re-establish the underlying channel
    async fn reconnect(&mut self) -> ModbusResult<()>;

    /// Close the transport connection
    async fn close(&mut self) -> ModbusResult<()>;

    /// Check if the transport connection is active
    ///
    /// This is a local check and does not verify that the remote device is
    /// responsive.
    fn is_connected(&self) -> bool;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    fn record_error(&mut self, error: &ModbusError) {
        self.errors += 1;
        if matches!(error, ModbusError::Timeout { .. }) {
            self.timeouts += 1;
        }
    }
}

fn not_connected() -> ModbusError {
    ModbusError::connection_lost("Transport is not connected")
}

// ---------------------------------------------------------------------------
// MBAP framing
// ---------------------------------------------------------------------------

/// Build an MBAP frame: header followed by the PDU
///
/// ```rust
/// use modbus_engine::transport::{encode_mbap_frame, Adu};
///
/// let adu = Adu { transaction_id: Some(1), unit_id: 0x11, pdu: vec![0x03, 0x00, 0x6B, 0x00, 0x03] };
/// let frame = encode_mbap_frame(&adu).unwrap();
/// assert_eq!(frame, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
/// ```
pub fn encode_mbap_frame(adu: &Adu) -> ModbusResult<Vec<u8>> {
    if adu.pdu.is_empty() || adu.pdu.len() > MAX_TCP_FRAME_SIZE - MBAP_HEADER_SIZE {
        return Err(ModbusError::malformed(format!(
            "PDU length {} cannot be framed", adu.pdu.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_SIZE + adu.pdu.len());
    frame.put_u16(adu.transaction_id.unwrap_or(0));
    frame.put_u16(0);
    frame.put_u16((adu.pdu.len() + 1) as u16);
    frame.put_u8(adu.unit_id);
    frame.put_slice(&adu.pdu);
    Ok(frame.to_vec())
}

/// Take one complete MBAP frame off the front of `buffer`
///
/// Returns `Ok(None)` while the frame is still incomplete. A header that
/// cannot be valid (protocol id other than 0, length outside 2..=254)
/// fails with `MalformedFrame`.
pub fn take_mbap_frame(buffer: &mut BytesMut) -> ModbusResult<Option<Adu>> {
    if buffer.len() < MBAP_HEADER_SIZE {
        return Ok(None);
    }

    let transaction_id = u16::from_be_bytes([buffer[0], buffer[1]]);
    let protocol_id = u16::from_be_bytes([buffer[2], buffer[3]]);
    let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;

    if protocol_id != 0 {
        return Err(ModbusError::malformed(format!("MBAP protocol id {} is not Modbus", protocol_id)));
    }
    if !(2..=254).contains(&length) {
        return Err(ModbusError::malformed(format!("MBAP length {} out of range 2..=254", length)));
    }

    let total = MBAP_HEADER_SIZE - 1 + length;
    if buffer.len() < total {
        return Ok(None);
    }

    let mut frame = buffer.split_to(total);
    frame.advance(MBAP_HEADER_SIZE - 1);
    let unit_id = frame.get_u8();

    Ok(Some(Adu {
        transaction_id: Some(transaction_id),
        unit_id,
        pdu: frame.to_vec(),
    }))
}

// ---------------------------------------------------------------------------
// RTU framing
// ---------------------------------------------------------------------------

/// Calculate the Modbus CRC-16 of `data`
pub fn calculate_crc(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Inter-frame silence for a baud rate
///
/// 3.5 character times at 11 bits per character, fixed at 1750 µs above
/// 19200 baud.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19200 {
        return HIGH_BAUD_FRAME_GAP;
    }
    let baud = baud_rate.max(1) as u64;
    Duration::from_micros(11 * 1_000_000 * 35 / (baud * 10))
}

/// Build an RTU frame: unit id, PDU, CRC (low byte first)
pub fn encode_rtu_frame(unit_id: SlaveId, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    let crc = calculate_crc(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Validate an RTU frame and split it into unit id and PDU
pub fn decode_rtu_frame(frame: &[u8]) -> ModbusResult<Adu> {
    if frame.len() < MIN_RTU_FRAME_SIZE || frame.len() > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::malformed(format!(
            "RTU frame length {} out of range {}..={}",
            frame.len(), MIN_RTU_FRAME_SIZE, MAX_RTU_FRAME_SIZE
        )));
    }

    let data_len = frame.len() - 2;
    let expected = calculate_crc(&frame[..data_len]);
    let actual = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    if expected != actual {
        return Err(ModbusError::crc_mismatch(expected, actual));
    }

    Ok(Adu {
        transaction_id: None,
        unit_id: frame[0],
        pdu: frame[1..data_len].to_vec(),
    })
}

/// Read one RTU frame, ending it after `gap` of line silence
///
/// Waits indefinitely for the first byte; callers bound the wait with a
/// timeout. EOF before any byte arrives is `ConnectionLost`. Frames longer
/// than the RTU maximum fail with `MalformedFrame`.
pub async fn read_rtu_frame<S>(stream: &mut S, gap: Duration) -> ModbusResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut frame = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
    let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];

    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(ModbusError::connection_lost("Serial stream closed"));
    }
    frame.put_slice(&chunk[..n]);

    loop {
        match timeout(gap, stream.read(&mut chunk)).await {
            // Silence: the frame is complete
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => frame.put_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }

        if frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::malformed(format!(
                "RTU frame exceeds {} bytes", MAX_RTU_FRAME_SIZE
            )));
        }
    }

    Ok(frame.to_vec())
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// Modbus TCP transport implementation
pub struct TcpTransport {
    stream: Option<Box<dyn ByteStream>>,
    /// Remembered for reconnect; `None` for stream-built transports
    address: Option<String>,
    connect_timeout: Duration,
    read_buffer: BytesMut,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Connect to a Modbus TCP device
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port` of the device
    /// * `connect_timeout` - Upper bound on establishing the connection
    pub async fn connect(address: impl Into<String>, connect_timeout: Duration) -> ModbusResult<Self> {
        let address = address.into();
        let stream = Self::open_stream(&address, connect_timeout).await?;

        Ok(Self {
            stream: Some(Box::new(stream)),
            address: Some(address),
            connect_timeout,
            read_buffer: BytesMut::with_capacity(MAX_TCP_FRAME_SIZE),
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    /// Run the MBAP framing over an already established stream
    ///
    /// Such a transport cannot reconnect.
    pub fn from_stream<S: ByteStream + 'static>(stream: S) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            address: None,
            connect_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            read_buffer: BytesMut::with_capacity(MAX_TCP_FRAME_SIZE),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Address this transport connects to, if any
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    async fn open_stream(address: &str, connect_timeout: Duration) -> ModbusResult<TcpStream> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout(format!("connect to {}", address), connect_timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::transport(format!("Failed to connect to {}: {}", address, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        debug!("Connected to Modbus TCP device at {}", address);
        Ok(stream)
    }

    async fn read_frame(&mut self, deadline: Instant, timeout_ms: u64) -> ModbusResult<Adu> {
        loop {
            match take_mbap_frame(&mut self.read_buffer) {
                Ok(Some(adu)) => return Ok(adu),
                Ok(None) => {},
                Err(e) => {
                    // Resynchronise on the next read
                    self.read_buffer.clear();
                    return Err(e);
                },
            }

            let stream = self.stream.as_mut().ok_or_else(not_connected)?;
            self.read_buffer.reserve(MAX_TCP_FRAME_SIZE);
            let n = timeout_at(deadline, stream.read_buf(&mut self.read_buffer))
                .await
                .map_err(|_| ModbusError::timeout("waiting for MBAP response", timeout_ms))??;

            if n == 0 {
                return Err(ModbusError::connection_lost("Peer closed the TCP connection"));
            }
            self.stats.bytes_received += n as u64;
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn send(&mut self, adu: &Adu) -> ModbusResult<()> {
        let frame = encode_mbap_frame(adu)?;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        if self.packet_logging {
            log_packet("send", &frame, "TCP", Some(adu.unit_id));
        }

        let result = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<(), ModbusError>(())
        }.await;

        match result {
            Ok(()) => {
                self.stats.requests_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            },
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            },
        }
    }

    async fn receive(&mut self, timeout: Duration) -> ModbusResult<Adu> {
        let deadline = Instant::now() + timeout;
        match self.read_frame(deadline, timeout.as_millis() as u64).await {
            Ok(adu) => {
                self.stats.responses_received += 1;
                if self.packet_logging {
                    // Re-framed for the dump; the header is fully determined by the ADU
                    if let Ok(frame) = encode_mbap_frame(&adu) {
                        log_packet("receive", &frame, "TCP", Some(adu.unit_id));
                    }
                }
                Ok(adu)
            },
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            },
        }
    }

    /// Late MBAP frames are told apart by transaction id when they arrive,
    /// so only what is already readable gets dropped here.
    async fn discard_input(&mut self, _late_window: Duration) -> ModbusResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        // Pull in whatever is already readable without waiting
        loop {
            self.read_buffer.reserve(MAX_TCP_FRAME_SIZE);
            match timeout(Duration::ZERO, stream.read_buf(&mut self.read_buffer)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => self.stats.bytes_received += n as u64,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let mut discarded = 0;
        loop {
            match take_mbap_frame(&mut self.read_buffer) {
                Ok(Some(adu)) => {
                    warn!("Discarding stale MBAP frame, transaction {:?}", adu.transaction_id);
                    discarded += 1;
                },
                Ok(None) => break,
                Err(_) => {
                    discarded += 1;
                    self.read_buffer.clear();
                    break;
                },
            }
        }
        Ok(discarded)
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        let address = self.address.clone().ok_or_else(|| {
            ModbusError::connection_lost("Transport was built from a stream and cannot reconnect")
        })?;

        self.close().await?;
        let stream = Self::open_stream(&address, self.connect_timeout).await?;
        self.stream = Some(Box::new(stream));
        info!("Reconnected to Modbus TCP device at {}", address);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.read_buffer.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ---------------------------------------------------------------------------
// RTU transport
// ---------------------------------------------------------------------------

/// Serial line settings for an RTU transport
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
}

impl SerialConfig {
    /// 8 data bits, no parity, one stop bit
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
        }
    }
}

/// Modbus RTU transport implementation
pub struct RtuTransport {
    stream: Option<Box<dyn ByteStream>>,
    /// Serial settings for reopening; `None` for stream-built transports
    serial: Option<SerialConfig>,
    baud_rate: u32,
    /// Minimum silence between frames
    frame_gap: Duration,
    /// End of the last frame sent or received on the line
    last_activity: Option<Instant>,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl RtuTransport {
    /// Open a serial port
    pub fn open(config: SerialConfig) -> ModbusResult<Self> {
        let stream = Self::open_port(&config)?;
        let mut transport = Self::from_stream(stream, config.baud_rate);
        transport.serial = Some(config);
        Ok(transport)
    }

    /// Run the RTU framing over an already established stream
    pub fn from_stream<S: ByteStream + 'static>(stream: S, baud_rate: u32) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            serial: None,
            baud_rate,
            frame_gap: frame_gap(baud_rate),
            last_activity: None,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Inter-frame silence in use
    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    fn open_port(config: &SerialConfig) -> ModbusResult<tokio_serial::SerialStream> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity);

        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| ModbusError::transport(format!("Failed to open serial port {}: {}", config.port, e)))?;

        debug!("Opened serial port {} at {} baud", config.port, config.baud_rate);
        Ok(port)
    }

    /// Instant at which the line has been silent for one frame gap
    fn line_ready_at(&self) -> Option<Instant> {
        self.last_activity.map(|last| last + self.frame_gap)
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtu
    }

    async fn send(&mut self, adu: &Adu) -> ModbusResult<()> {
        let frame = encode_rtu_frame(adu.unit_id, &adu.pdu);
        if frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::malformed(format!("RTU frame of {} bytes is too large", frame.len())));
        }

        if let Some(ready) = self.line_ready_at() {
            tokio::time::sleep_until(ready).await;
        }

        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        if self.packet_logging {
            log_packet("send", &frame, "RTU", Some(adu.unit_id));
        }

        let result = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<(), ModbusError>(())
        }.await;

        self.last_activity = Some(Instant::now());
        match result {
            Ok(()) => {
                self.stats.requests_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            },
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            },
        }
    }

    async fn receive(&mut self, wait: Duration) -> ModbusResult<Adu> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        let result = match timeout(wait, read_rtu_frame(stream, self.frame_gap)).await {
            Ok(Ok(frame)) => {
                self.stats.bytes_received += frame.len() as u64;
                if self.packet_logging {
                    log_packet("receive", &frame, "RTU", frame.first().copied());
                }
                decode_rtu_frame(&frame)
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ModbusError::timeout("waiting for RTU response", wait.as_millis() as u64)),
        };
        self.last_activity = Some(Instant::now());

        match result {
            Ok(adu) => {
                self.stats.responses_received += 1;
                Ok(adu)
            },
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            },
        }
    }

    async fn discard_input(&mut self, late_window: Duration) -> ModbusResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let mut buffer = [0u8; MAX_RTU_FRAME_SIZE];
        let mut discarded = 0;

        if !late_window.is_zero() {
            match timeout(late_window, stream.read(&mut buffer)).await {
                Err(_) => {},
                Ok(Ok(0)) => return Err(ModbusError::connection_lost("Serial stream closed")),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        // Drain until the line has been quiet for a full frame gap
        loop {
            match timeout(self.frame_gap, stream.read(&mut buffer)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if discarded > 0 {
            warn!("Discarded {} stale bytes from the serial line", discarded);
            self.stats.bytes_received += discarded as u64;
        }
        self.last_activity = Some(Instant::now());
        Ok(discarded)
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        let config = self.serial.clone().ok_or_else(|| {
            ModbusError::connection_lost("Transport was built from a stream and cannot reconnect")
        })?;

        self.close().await?;
        let port = Self::open_port(&config)?;
        self.stream = Some(Box::new(port));
        self.last_activity = None;
        info!("Reopened serial port {}", config.port);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        // Dropping the serial stream releases the port
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
