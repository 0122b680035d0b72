/// Modbus protocol definitions and data structures
///
/// This module contains the core Modbus protocol definitions: function
/// codes, exception codes, and the closed request/response variants the
/// engine exchanges with devices.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Wire value of an ON coil in a write single coil request
pub const COIL_ON: u16 = 0xFF00;

/// Wire value of an OFF coil in a write single coil request
pub const COIL_OFF: u16 = 0x0000;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Function codes recognised by the engine but deliberately not implemented
pub const UNSUPPORTED_FUNCTIONS: &[(u8, &str)] = &[
    (0x08, "Diagnostics"),
    (0x0B, "Get Comm Event Counter"),
    (0x11, "Report Server ID"),
    (0x16, "Mask Write Register"),
    (0x2B, "Read Device Identification"),
];

/// Modbus function codes supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl ModbusFunction {
    /// All supported function codes, in code order
    pub const ALL: [ModbusFunction; 9] = [
        ModbusFunction::ReadCoils,
        ModbusFunction::ReadDiscreteInputs,
        ModbusFunction::ReadHoldingRegisters,
        ModbusFunction::ReadInputRegisters,
        ModbusFunction::WriteSingleCoil,
        ModbusFunction::WriteSingleRegister,
        ModbusFunction::WriteMultipleCoils,
        ModbusFunction::WriteMultipleRegisters,
        ModbusFunction::ReadWriteMultipleRegisters,
    ];

    /// Convert from u8 to ModbusFunction
    ///
    /// This is the boundary where raw codes enter the engine: anything that
    /// is not one of the nine supported codes is rejected as `Unsupported`.
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x17 => Ok(ModbusFunction::ReadWriteMultipleRegisters),
            _ => {
                let name = UNSUPPORTED_FUNCTIONS
                    .iter()
                    .find(|(code, _)| *code == value)
                    .map(|(_, name)| *name)
                    .unwrap_or("Unknown Function");
                Err(ModbusError::unsupported(value, name))
            }
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        }
    }

    /// Check if this function reads data from the device
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters |
            ModbusFunction::ReadWriteMultipleRegisters
        )
    }

    /// Check if this function writes data to the device
    pub fn is_write_function(self) -> bool {
        matches!(self,
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteSingleRegister |
            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters |
            ModbusFunction::ReadWriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short operator-facing explanation of the code
    pub fn description(self) -> &'static str {
        use ModbusException::*;
        match self {
            IllegalFunction => "function code not supported by the device",
            IllegalDataAddress => "address range outside the device's tables",
            IllegalDataValue => "value or quantity rejected by the device",
            ServerDeviceFailure => "device failed while executing the request",
            Acknowledge => "request accepted, still processing",
            ServerDeviceBusy => "device busy with a long-running command",
            MemoryParityError => "parity error reading extended memory",
            GatewayPathUnavailable => "gateway has no path to the target",
            GatewayTargetDeviceFailedToRespond => "target behind the gateway did not answer",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus request
///
/// One variant per supported function code. Addresses are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: ModbusAddress, quantity: u16 },
    ReadDiscreteInputs { address: ModbusAddress, quantity: u16 },
    ReadHoldingRegisters { address: ModbusAddress, quantity: u16 },
    ReadInputRegisters { address: ModbusAddress, quantity: u16 },
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, values: Vec<bool> },
    WriteMultipleRegisters { address: ModbusAddress, values: Vec<ModbusValue> },
    ReadWriteMultipleRegisters {
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        values: Vec<ModbusValue>,
    },
}

impl ModbusRequest {
    /// Build a write single coil request from a raw wire value
    ///
    /// Only 0xFF00 (ON) and 0x0000 (OFF) are accepted.
    pub fn write_single_coil_raw(address: ModbusAddress, raw: u16) -> ModbusResult<Self> {
        let value = data_utils::coil_from_wire(raw).ok_or_else(|| {
            ModbusError::invalid_argument(format!(
                "Coil value must be 0xFF00 or 0x0000, got 0x{:04X}", raw
            ))
        })?;
        Ok(ModbusRequest::WriteSingleCoil { address, value })
    }

    /// Function code of this request
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusRequest::ReadCoils { .. } => ModbusFunction::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusRequest::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusRequest::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            ModbusRequest::ReadWriteMultipleRegisters { .. } => ModbusFunction::ReadWriteMultipleRegisters,
        }
    }

    /// Starting address (the read address for read/write requests)
    pub fn address(&self) -> ModbusAddress {
        match self {
            ModbusRequest::ReadCoils { address, .. }
            | ModbusRequest::ReadDiscreteInputs { address, .. }
            | ModbusRequest::ReadHoldingRegisters { address, .. }
            | ModbusRequest::ReadInputRegisters { address, .. }
            | ModbusRequest::WriteSingleCoil { address, .. }
            | ModbusRequest::WriteSingleRegister { address, .. }
            | ModbusRequest::WriteMultipleCoils { address, .. }
            | ModbusRequest::WriteMultipleRegisters { address, .. } => *address,
            ModbusRequest::ReadWriteMultipleRegisters { read_address, .. } => *read_address,
        }
    }

    /// Number of coils/registers addressed (read side for read/write requests)
    pub fn quantity(&self) -> usize {
        match self {
            ModbusRequest::ReadCoils { quantity, .. }
            | ModbusRequest::ReadDiscreteInputs { quantity, .. }
            | ModbusRequest::ReadHoldingRegisters { quantity, .. }
            | ModbusRequest::ReadInputRegisters { quantity, .. } => *quantity as usize,
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => 1,
            ModbusRequest::WriteMultipleCoils { values, .. } => values.len(),
            ModbusRequest::WriteMultipleRegisters { values, .. } => values.len(),
            ModbusRequest::ReadWriteMultipleRegisters { read_quantity, .. } => *read_quantity as usize,
        }
    }

    /// Validate protocol limits and address ranges
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                validation::validate_coil_count(*quantity as usize, crate::MAX_READ_COILS)?;
                validation::validate_address_range(*address, *quantity as usize)
            },
            ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => {
                validation::validate_register_count(*quantity as usize, crate::MAX_READ_REGISTERS)?;
                validation::validate_address_range(*address, *quantity as usize)
            },
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => Ok(()),
            ModbusRequest::WriteMultipleCoils { address, values } => {
                validation::validate_coil_count(values.len(), crate::MAX_WRITE_COILS)?;
                validation::validate_address_range(*address, values.len())
            },
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                validation::validate_register_count(values.len(), crate::MAX_WRITE_REGISTERS)?;
                validation::validate_address_range(*address, values.len())
            },
            ModbusRequest::ReadWriteMultipleRegisters { read_address, read_quantity, write_address, values } => {
                validation::validate_register_count(*read_quantity as usize, crate::MAX_READ_REGISTERS)?;
                validation::validate_address_range(*read_address, *read_quantity as usize)?;
                validation::validate_register_count(values.len(), crate::MAX_READ_WRITE_WRITE_REGISTERS)?;
                validation::validate_address_range(*write_address, values.len())
            },
        }
    }
}

/// Modbus response
///
/// Success payloads mirror the request variants; `Exception` carries the
/// raw exception code reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<ModbusValue>),
    ReadInputRegisters(Vec<ModbusValue>),
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: ModbusValue },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16 },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16 },
    ReadWriteMultipleRegisters(Vec<ModbusValue>),
    Exception { function: ModbusFunction, code: u8 },
}

impl ModbusResponse {
    /// Function code this response answers
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusResponse::ReadCoils(_) => ModbusFunction::ReadCoils,
            ModbusResponse::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs,
            ModbusResponse::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
            ModbusResponse::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
            ModbusResponse::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusResponse::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusResponse::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusResponse::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            ModbusResponse::ReadWriteMultipleRegisters(_) => ModbusFunction::ReadWriteMultipleRegisters,
            ModbusResponse::Exception { function, .. } => *function,
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusResponse::Exception { .. })
    }

    /// Known exception, if this is an exception response with a standard code
    pub fn exception(&self) -> Option<ModbusException> {
        match self {
            ModbusResponse::Exception { code, .. } => ModbusException::from_u8(*code),
            _ => None,
        }
    }

    /// Turn an exception response into `ModbusError::Exception`
    pub fn into_result(self) -> ModbusResult<Self> {
        match self {
            ModbusResponse::Exception { function, code } => {
                Err(ModbusError::exception(function.to_u8(), code))
            },
            other => Ok(other),
        }
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Registers as big-endian byte pairs
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        registers.iter().flat_map(|r| r.to_be_bytes()).collect()
    }

    /// Big-endian byte pairs back to registers; an odd length is malformed
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        let pairs = bytes.chunks_exact(2);
        if !pairs.remainder().is_empty() {
            return Err(ModbusError::malformed(format!(
                "Register data has odd length {}", bytes.len()
            )));
        }
        Ok(pairs.map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect())
    }

    /// Bit-pack coils eight per byte, first coil in the least significant bit
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        bits.chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (bit, &on)| if on { byte | 1 << bit } else { byte })
            })
            .collect()
    }

    /// Inverse of [`pack_bits`]; missing bytes read as OFF
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).is_some_and(|byte| byte >> (i % 8) & 1 == 1))
            .collect()
    }

    /// Number of bytes needed to carry `bit_count` packed bits
    pub fn packed_len(bit_count: usize) -> usize {
        (bit_count + 7) / 8
    }

    /// Wire encoding of a single coil value
    pub fn coil_to_wire(value: bool) -> u16 {
        if value { COIL_ON } else { COIL_OFF }
    }

    /// Decode a single coil wire value; any pattern but 0xFF00/0x0000 is `None`
    pub fn coil_from_wire(raw: u16) -> Option<bool> {
        match raw {
            COIL_ON => Some(true),
            COIL_OFF => Some(false),
            _ => None,
        }
    }
}
