//! Callback-based request/response logging
//!
//! Applications that embed the engine often want transaction traffic in
//! their own log sink rather than in `tracing` output. A `CallbackLogger`
//! attached to a [`crate::connection::Connection`] receives every request,
//! response and failure, rendered raw (PDU hex), interpreted (decoded
//! fields), or both.

use std::sync::Arc;

use crate::error::ModbusError;
use crate::protocol::{ModbusRequest, ModbusResponse};

/// Severity passed to a [`LogCallback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    /// Raw frame bytes in [`LoggingMode::Both`]
    Debug,
}

/// How requests and responses are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw PDU bytes only
    Raw,
    /// Show decoded fields
    Interpreted,
    /// Interpreted at the requested level, raw at debug
    Both,
}

impl LogLevel {
    /// Upper-case tag used by [`CallbackLogger::console`]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Sink for formatted log lines
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Application-facing transaction log
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Logger rendering in `mode` instead of [`LoggingMode::Interpreted`]
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with timestamped console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Logger that drops everything
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Forward `message` if `level` passes the minimum
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log an outgoing request
    pub fn log_request(&self, unit_id: u8, transaction_id: u16, request: &ModbusRequest, pdu: &[u8]) {
        let interpreted = || {
            format!(
                "Modbus Request -> Unit: {}, Transaction: {}, Function: {}, {}",
                unit_id, transaction_id, request.function(), interpret_request(request)
            )
        };
        self.emit(interpreted, || format!("Modbus Request -> Raw: {}", hex::encode_upper(pdu)));
    }

    /// Log a decoded response, including exception responses
    pub fn log_response(&self, unit_id: u8, transaction_id: u16, response: &ModbusResponse, pdu: &[u8]) {
        let interpreted = || {
            format!(
                "Modbus Response <- Unit: {}, Transaction: {}, Function: {}, {}",
                unit_id, transaction_id, response.function(), interpret_response(response)
            )
        };
        self.emit(interpreted, || format!("Modbus Response <- Raw: {}", hex::encode_upper(pdu)));
    }

    /// Log a transaction that failed without a response
    pub fn log_failure(&self, unit_id: u8, transaction_id: u16, error: &ModbusError) {
        self.warn(&format!(
            "Modbus Transaction failed -> Unit: {}, Transaction: {}, Error: {}",
            unit_id, transaction_id, error
        ));
    }

    fn emit(&self, interpreted: impl FnOnce() -> String, raw: impl FnOnce() -> String) {
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&interpreted()),
            LoggingMode::Both => {
                self.info(&interpreted());
                self.debug(&raw());
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn interpret_request(request: &ModbusRequest) -> String {
    match request {
        ModbusRequest::ReadCoils { address, quantity }
        | ModbusRequest::ReadDiscreteInputs { address, quantity }
        | ModbusRequest::ReadHoldingRegisters { address, quantity }
        | ModbusRequest::ReadInputRegisters { address, quantity } => {
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        ModbusRequest::WriteSingleCoil { address, value } => {
            format!("Address: {}, Value: {}", address, if *value { "ON" } else { "OFF" })
        }
        ModbusRequest::WriteSingleRegister { address, value } => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        ModbusRequest::WriteMultipleCoils { address, values } => {
            format!("Address: {}, Coils: {:?}", address, truncated(values, 16))
        }
        ModbusRequest::WriteMultipleRegisters { address, values } => {
            format!("Address: {}, Registers: {:?}", address, truncated(values, 8))
        }
        ModbusRequest::ReadWriteMultipleRegisters { read_address, read_quantity, write_address, values } => {
            format!(
                "Read Address: {}, Read Quantity: {}, Write Address: {}, Registers: {:?}",
                read_address, read_quantity, write_address, truncated(values, 8)
            )
        }
    }
}

fn interpret_response(response: &ModbusResponse) -> String {
    match response {
        ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
            format!("Count: {}, Coils: {:?}", bits.len(), truncated(bits, 16))
        }
        ModbusResponse::ReadHoldingRegisters(values)
        | ModbusResponse::ReadInputRegisters(values)
        | ModbusResponse::ReadWriteMultipleRegisters(values) => {
            format!("Count: {}, Registers: {:?}", values.len(), truncated(values, 8))
        }
        ModbusResponse::WriteSingleCoil { address, value } => {
            format!("Address: {}, Value: {}", address, if *value { "ON" } else { "OFF" })
        }
        ModbusResponse::WriteSingleRegister { address, value } => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        ModbusResponse::WriteMultipleCoils { address, quantity }
        | ModbusResponse::WriteMultipleRegisters { address, quantity } => {
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        ModbusResponse::Exception { code, .. } => match response.exception() {
            Some(exception) => format!("Exception: {}", exception),
            None => format!("Exception: unknown code 0x{:02X}", code),
        },
    }
}

fn truncated<T>(values: &[T], limit: usize) -> &[T] {
    &values[..values.len().min(limit)]
}
