//! # Modbus Engine - Async Modbus TCP/RTU Client Engine
//!
//! A Modbus client engine in pure Rust: a PDU codec for the nine supported
//! function codes, TCP (MBAP) and RTU (CRC-16) framing, a transaction
//! manager that enforces one outstanding request per connection, and a
//! typed client API on top.
//!
//! ## Features
//!
//! - **Async I/O**: built on Tokio; every blocking wait has a deadline
//! - **Two Transports**: Modbus TCP and Modbus RTU over any byte stream
//! - **Strict Correlation**: responses are matched by transaction id (TCP)
//!   and unit id; stale frames from abandoned transactions are discarded
//! - **Local Validation**: out-of-range requests fail before touching the wire
//! - **Monitoring**: per-connection metrics and callback packet logging
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Simulator |
//! |------|----------|--------|-----------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//!
//! Codes 0x08, 0x0B, 0x11, 0x16 and 0x2B/0x0E are recognised and reported
//! as `Unsupported`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_engine::{Connection, ModbusClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = Connection::connect_tcp("127.0.0.1:502", Duration::from_secs(5))
//!         .await?
//!         .with_unit_id(1);
//!
//!     // Read holding registers
//!     let values = client.read_03(0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     // Write single register
//!     client.write_06(100, 0x1234).await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! ModbusClient ops ─► Connection::dispatch ─► codec::encode_request ─► ModbusTransport::send
//!                                                                              │ wire
//! typed result ◄─ codec::decode_response ◄─ Transaction::correlate ◄─ ModbusTransport::receive
//! ```
//!
//! [`DeviceSimulator`] runs the same codec and framing in the other
//! direction, backed by a [`ModbusRegisterBank`].

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions: function codes, requests, responses
pub mod protocol;

/// PDU encoding and decoding
pub mod codec;

/// Transport layer for TCP and RTU framing
pub mod transport;

/// Transaction ids, deadlines and correlation
pub mod transaction;

/// One-transaction-at-a-time connection
pub mod connection;

/// High-level client operations
pub mod client;

/// File-based application settings
pub mod config;

/// Thread-safe register storage for the device simulator
pub mod register_bank;

/// Modbus device simulator over any byte stream
pub mod simulator;

/// Utility functions and performance monitoring
pub mod utils;

/// Callback logging for request/response traffic
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusRequest, ModbusResponse, ModbusFunction, ModbusException};
pub use transport::{Adu, ModbusTransport, TcpTransport, RtuTransport, SerialConfig, TransportKind, TransportStats};
pub use transaction::{Transaction, TransactionIdCounter};
pub use connection::{Connection, ConnectionState};
pub use client::ModbusClient;
pub use config::{AppSettings, ClientSettings};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use simulator::DeviceSimulator;
pub use utils::{PerformanceMetrics, OperationTimer};
pub use logging::{LogLevel, LogCallback, CallbackLogger, LoggingMode};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils or discrete inputs read in a single request
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of registers read in a single request
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of coils written in a single request
pub const MAX_WRITE_COILS: usize = 1968;

/// Maximum number of registers written in a single request
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of registers written by a read/write request (0x17)
pub const MAX_READ_WRITE_WRITE_REGISTERS: usize = 121;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Engine v{} - async Modbus TCP/RTU client engine", VERSION)
}
