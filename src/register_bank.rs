/// Modbus register bank for simulated devices
///
/// Thread-safe storage for the four Modbus data tables: coils, discrete
/// inputs, holding registers and input registers. The bank covers a fixed
/// address space; any access that runs past it fails with exception 0x02
/// (Illegal Data Address), the same answer a real device gives.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ModbusFunction, ModbusValue};

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Backing tables for a simulated device
///
/// Cloning shares the underlying tables, so a simulator task and a test can
/// look at the same device. Unwritten addresses read as `false` / `0`.
#[derive(Debug, Clone)]
pub struct ModbusRegisterBank {
    /// Number of addresses in each table
    size: usize,
    /// Writable bits, 0x01/0x05/0x0F
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    /// Read-only bits, 0x02
    discrete_inputs: Arc<RwLock<HashMap<u16, bool>>>,
    /// Writable words, 0x03/0x06/0x10/0x17
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    /// Input registers (read-only) - 16 bits each
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
}

fn check_range(function: ModbusFunction, address: ModbusAddress, count: usize, size: usize) -> ModbusResult<()> {
    if address as usize + count > size {
        return Err(ModbusError::exception(function.to_u8(), ILLEGAL_DATA_ADDRESS));
    }
    Ok(())
}

fn poisoned(function: ModbusFunction) -> ModbusError {
    ModbusError::exception(function.to_u8(), SERVER_DEVICE_FAILURE)
}

fn read_table<V: Copy + Default>(
    table: &RwLock<HashMap<u16, V>>,
    function: ModbusFunction,
    address: ModbusAddress,
    quantity: u16,
    size: usize,
) -> ModbusResult<Vec<V>> {
    check_range(function, address, quantity as usize, size)?;
    let table = table.read().map_err(|_| poisoned(function))?;
    Ok((0..quantity)
        .map(|i| table.get(&(address + i)).copied().unwrap_or_default())
        .collect())
}

fn write_table<V: Copy>(
    table: &RwLock<HashMap<u16, V>>,
    function: ModbusFunction,
    address: ModbusAddress,
    values: &[V],
    size: usize,
) -> ModbusResult<()> {
    check_range(function, address, values.len(), size)?;
    let mut table = table.write().map_err(|_| poisoned(function))?;
    for (offset, &value) in values.iter().enumerate() {
        table.insert(address + offset as u16, value);
    }
    Ok(())
}

impl ModbusRegisterBank {
    /// Create a register bank spanning the full 0..=65535 address space
    pub fn new() -> Self {
        Self::with_size(u16::MAX as usize + 1)
    }

    /// Create a register bank with addresses `0..size` in each table
    pub fn with_size(size: usize) -> Self {
        Self {
            size: size.min(u16::MAX as usize + 1),
            coils: Arc::new(RwLock::new(HashMap::new())),
            discrete_inputs: Arc::new(RwLock::new(HashMap::new())),
            holding_registers: Arc::new(RwLock::new(HashMap::new())),
            input_registers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of addresses in each table
    pub fn size(&self) -> usize {
        self.size
    }

    /// 0x01
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_table(&self.coils, ModbusFunction::ReadCoils, address, quantity, self.size)
    }

    pub fn read_01(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_coils(address, quantity)
    }

    /// 0x05
    pub fn write_05(&self, address: u16, value: bool) -> ModbusResult<()> {
        write_table(&self.coils, ModbusFunction::WriteSingleCoil, address, &[value], self.size)
    }

    /// 0x0F; the whole range is checked before any bit changes
    pub fn write_0f(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        write_table(&self.coils, ModbusFunction::WriteMultipleCoils, address, values, self.size)
    }

    /// 0x02
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_table(&self.discrete_inputs, ModbusFunction::ReadDiscreteInputs, address, quantity, self.size)
    }

    pub fn read_02(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_discrete_inputs(address, quantity)
    }

    /// 0x03
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_table(&self.holding_registers, ModbusFunction::ReadHoldingRegisters, address, quantity, self.size)
    }

    pub fn read_03(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_holding_registers(address, quantity)
    }

    /// 0x06
    pub fn write_06(&self, address: u16, value: u16) -> ModbusResult<()> {
        write_table(&self.holding_registers, ModbusFunction::WriteSingleRegister, address, &[value], self.size)
    }

    /// 0x10; the whole range is checked before any register changes
    pub fn write_10(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        write_table(&self.holding_registers, ModbusFunction::WriteMultipleRegisters, address, values, self.size)
    }

    /// 0x04
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_table(&self.input_registers, ModbusFunction::ReadInputRegisters, address, quantity, self.size)
    }

    pub fn read_04(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_input_registers(address, quantity)
    }

    /// Write then read holding registers as one step (function code 0x17)
    ///
    /// Both ranges are checked before anything is written.
    pub fn read_write_17(
        &self,
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<Vec<ModbusValue>> {
        let function = ModbusFunction::ReadWriteMultipleRegisters;
        check_range(function, write_address, values.len(), self.size)?;
        check_range(function, read_address, read_quantity as usize, self.size)?;

        let mut registers = self.holding_registers.write().map_err(|_| poisoned(function))?;
        for (offset, &value) in values.iter().enumerate() {
            registers.insert(write_address + offset as u16, value);
        }
        Ok((0..read_quantity)
            .map(|i| registers.get(&(read_address + i)).copied().unwrap_or(0))
            .collect())
    }

    /// Input registers are read-only on the wire; seed them here
    pub fn set_input_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.set_input_registers(address, &[value])
    }

    /// Set a run of input registers (for simulation/testing)
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        write_table(&self.input_registers, ModbusFunction::ReadInputRegisters, address, values, self.size)
    }

    /// Discrete inputs are read-only on the wire; seed them here
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        write_table(&self.discrete_inputs, ModbusFunction::ReadDiscreteInputs, address, &[value], self.size)
    }

    /// Number of addresses that have been written in each table
    pub fn get_stats(&self) -> RegisterBankStats {
        fn len<V>(table: &RwLock<HashMap<u16, V>>) -> usize {
            table.read().map(|t| t.len()).unwrap_or(0)
        }

        RegisterBankStats {
            coils_count: len(&self.coils),
            discrete_inputs_count: len(&self.discrete_inputs),
            holding_registers_count: len(&self.holding_registers),
            input_registers_count: len(&self.input_registers),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of addresses written in each table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}
