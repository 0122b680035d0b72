//! # Modbus Engine Error Handling
//!
//! This module provides the error taxonomy for the engine, covering local
//! argument validation, frame decoding, transport failures, transaction
//! correlation and device-reported exceptions.
//!
//! ## Error Categories
//!
//! ### Caller Errors
//! - **Invalid Argument**: address/quantity/value bounds violated; never reaches the wire
//! - **Unsupported**: function codes the engine deliberately does not implement
//!
//! ### Protocol Errors
//! - **Malformed Frame**: PDU or ADU failed validation while decoding
//! - **CRC Mismatch**: RTU frame check failure
//! - **Exception**: standard Modbus exception reported by the device
//!
//! ### Transport Errors
//! - **Transport**: I/O failure on the underlying channel
//! - **Connection Lost**: the channel closed; the connection is now disconnected
//! - **Timeout**: no complete response before the deadline
//!
//! ### Transaction Errors
//! - **Connection Busy**: a transaction is already in flight on the connection
//!
//! ## Usage Examples
//!
//! ```rust
//! use modbus_engine::{ModbusError, ModbusResult};
//!
//! fn handle(result: ModbusResult<Vec<u16>>) {
//!     match result {
//!         Ok(values) => println!("Read {} registers", values.len()),
//!         Err(ModbusError::Exception { function, code, message }) => {
//!             println!("Device exception: {} (function={:02X}, code={:02X})", message, function, code);
//!         }
//!         Err(error) if error.is_recoverable() => println!("Retryable: {}", error),
//!         Err(error) => println!("Fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus engine error types
///
/// Every failure path in the engine yields one of these variants, so callers
/// can always tell a local validation failure apart from a wire problem or
/// a device-reported exception.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Caller-side bounds violation
    ///
    /// Raised before anything is written to the transport.
    ///
    /// # Examples
    /// - Reading 2001 coils (max 2000)
    /// - Starting address + quantity > 65536
    /// - Raw coil value other than 0xFF00 / 0x0000
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Function code recognised but not implemented by the engine
    #[error("Unsupported function code 0x{code:02X} ({name})")]
    Unsupported { code: u8, name: &'static str },

    /// Frame decoding failure
    ///
    /// # Examples
    /// - Byte count that does not match the requested quantity
    /// - Response function code that belongs to another request
    /// - MBAP protocol id other than zero
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// I/O failure on the transport channel
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The channel is gone; the connection is disconnected until reconnected
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// No complete response within the deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Another transaction is already in flight on this connection
    #[error("Connection busy: transaction {transaction_id} is still pending")]
    ConnectionBusy { transaction_id: u16 },

    /// The device answered with an exception PDU; `code` is the raw byte,
    /// see [`ModbusException`](crate::protocol::ModbusException) for the
    /// standard values
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Settings could not be loaded or are inconsistent
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create an unsupported function error
    pub fn unsupported(code: u8, name: &'static str) -> Self {
        Self::Unsupported { code, name }
    }

    /// Create a malformed frame error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a connection lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost { message: message.into() }
    }

    /// Create a timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms
        }
    }

    /// Create a connection busy error
    pub fn busy(transaction_id: u16) -> Self {
        Self::ConnectionBusy { transaction_id }
    }

    /// Exception reported by the device for `function`
    ///
    /// Codes outside the standard set keep their byte and get a generic
    /// message.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = ModbusException::from_u8(code)
            .map_or("non-standard exception code", ModbusException::description)
            .to_string();
        Self::Exception { function, code, message }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_engine::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read operation", 5000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let invalid = ModbusError::invalid_argument("quantity 0");
    /// assert!(!invalid.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::ConnectionLost { .. } => true,
            Self::Timeout { .. } => true,
            Self::ConnectionBusy { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            },
            _ => false,
        }
    }

    /// Check if the error is a channel issue rather than a protocol one
    ///
    /// ```rust
    /// use modbus_engine::ModbusError;
    ///
    /// assert!(ModbusError::connection_lost("peer closed").is_transport_error());
    /// assert!(!ModbusError::exception(0x03, 0x02).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Transport { .. } |
            Self::ConnectionLost { .. } |
            Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    ///
    /// ```rust
    /// use modbus_engine::ModbusError;
    ///
    /// assert!(ModbusError::exception(0x03, 0x02).is_protocol_error());
    /// assert!(!ModbusError::transport("Network unreachable").is_protocol_error());
    /// ```
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::MalformedFrame { .. } |
            Self::CrcMismatch { .. } |
            Self::Exception { .. }
        )
    }

    /// Exception code carried by a device exception, if any
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convert from std::io::Error
///
/// A closed peer is reported as `ConnectionLost`; everything else keeps the
/// original message as a `Transport` error.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::connection_lost(err.to_string()),
            _ => Self::transport(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The duration is unknown here; callers that know it build the error
/// with [`ModbusError::timeout`] directly.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
