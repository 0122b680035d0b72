/// High-level Modbus client interface
///
/// This module provides the user-facing operations, one per supported
/// function code, on top of a request executor.
///
/// Modbus TCP and RTU share the same application layer (PDU) and differ only
/// in transport encapsulation:
/// - TCP: MBAP Header + PDU
/// - RTU: Unit ID + PDU + CRC
///
/// The operations are therefore written once, as default methods of
/// [`ModbusClient`], and work over any [`Connection`].

use async_trait::async_trait;

use crate::connection::{Connection, ConnectionState};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ModbusRequest, ModbusResponse, ModbusValue};
use crate::transport::{ModbusTransport, TransportStats};

fn unexpected(expected: &str, response: ModbusResponse) -> ModbusError {
    ModbusError::malformed(format!(
        "Expected {} response, got {}", expected, response.function()
    ))
}

/// Trait defining the interface for Modbus client operations
///
/// Implementors supply `execute_request`; the nine operations validate their
/// arguments locally (`InvalidArgument`, nothing is sent), build the
/// request, and unwrap the response into typed data. Device exceptions come
/// back as `ModbusError::Exception`.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Execute a raw request and return the decoded response
    async fn execute_request(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&self) -> ModbusResult<()>;

    /// Get transport statistics
    async fn get_stats(&self) -> TransportStats;

    /// Read coils (function code 0x01)
    async fn read_01(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::ReadCoils { address, quantity };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::ReadCoils(bits) => Ok(bits),
            other => Err(unexpected("read coils", other)),
        }
    }

    /// Read discrete inputs (function code 0x02)
    async fn read_02(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::ReadDiscreteInputs { address, quantity };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::ReadDiscreteInputs(bits) => Ok(bits),
            other => Err(unexpected("read discrete inputs", other)),
        }
    }

    /// Read holding registers (function code 0x03)
    async fn read_03(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<ModbusValue>> {
        let request = ModbusRequest::ReadHoldingRegisters { address, quantity };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::ReadHoldingRegisters(values) => Ok(values),
            other => Err(unexpected("read holding registers", other)),
        }
    }

    /// Read input registers (function code 0x04)
    async fn read_04(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<ModbusValue>> {
        let request = ModbusRequest::ReadInputRegisters { address, quantity };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::ReadInputRegisters(values) => Ok(values),
            other => Err(unexpected("read input registers", other)),
        }
    }

    /// Write single coil (function code 0x05)
    async fn write_05(&self, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        match self.execute_request(ModbusRequest::WriteSingleCoil { address, value }).await? {
            ModbusResponse::WriteSingleCoil { .. } => Ok(()),
            other => Err(unexpected("write single coil", other)),
        }
    }

    /// Write single coil from its wire value, 0xFF00 (ON) or 0x0000 (OFF)
    async fn write_05_raw(&self, address: ModbusAddress, raw: u16) -> ModbusResult<()> {
        let request = ModbusRequest::write_single_coil_raw(address, raw)?;
        match self.execute_request(request).await? {
            ModbusResponse::WriteSingleCoil { .. } => Ok(()),
            other => Err(unexpected("write single coil", other)),
        }
    }

    /// Write single register (function code 0x06)
    async fn write_06(&self, address: ModbusAddress, value: ModbusValue) -> ModbusResult<()> {
        match self.execute_request(ModbusRequest::WriteSingleRegister { address, value }).await? {
            ModbusResponse::WriteSingleRegister { .. } => Ok(()),
            other => Err(unexpected("write single register", other)),
        }
    }

    /// Write multiple coils (function code 0x0F)
    async fn write_0f(&self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        let request = ModbusRequest::WriteMultipleCoils { address, values: values.to_vec() };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::WriteMultipleCoils { .. } => Ok(()),
            other => Err(unexpected("write multiple coils", other)),
        }
    }

    /// Write multiple registers (function code 0x10)
    async fn write_10(&self, address: ModbusAddress, values: &[ModbusValue]) -> ModbusResult<()> {
        let request = ModbusRequest::WriteMultipleRegisters { address, values: values.to_vec() };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::WriteMultipleRegisters { .. } => Ok(()),
            other => Err(unexpected("write multiple registers", other)),
        }
    }

    /// Read/write multiple registers (function code 0x17)
    ///
    /// The device performs the write before the read.
    async fn read_write_17(
        &self,
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<Vec<ModbusValue>> {
        let request = ModbusRequest::ReadWriteMultipleRegisters {
            read_address,
            read_quantity,
            write_address,
            values: values.to_vec(),
        };
        request.validate()?;
        match self.execute_request(request).await? {
            ModbusResponse::ReadWriteMultipleRegisters(values) => Ok(values),
            other => Err(unexpected("read/write multiple registers", other)),
        }
    }

    // Descriptive names
    async fn read_coils(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_01(address, quantity).await
    }

    async fn read_discrete_inputs(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_02(address, quantity).await
    }

    async fn read_holding_registers(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<ModbusValue>> {
        self.read_03(address, quantity).await
    }

    async fn read_input_registers(&self, address: ModbusAddress, quantity: u16) -> ModbusResult<Vec<ModbusValue>> {
        self.read_04(address, quantity).await
    }

    async fn write_single_coil(&self, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        self.write_05(address, value).await
    }

    async fn write_single_register(&self, address: ModbusAddress, value: ModbusValue) -> ModbusResult<()> {
        self.write_06(address, value).await
    }

    async fn write_multiple_coils(&self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        self.write_0f(address, values).await
    }

    async fn write_multiple_registers(&self, address: ModbusAddress, values: &[ModbusValue]) -> ModbusResult<()> {
        self.write_10(address, values).await
    }

    async fn read_write_multiple_registers(
        &self,
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<Vec<ModbusValue>> {
        self.read_write_17(read_address, read_quantity, write_address, values).await
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for Connection<T> {
    async fn execute_request(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.dispatch(request).await
    }

    fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    async fn close(&self) -> ModbusResult<()> {
        Connection::close(self).await
    }

    async fn get_stats(&self) -> TransportStats {
        self.transport_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::protocol::ModbusFunction;

    /// Answers every request with a canned response and records what it saw
    struct ScriptedClient {
        seen: Mutex<Vec<ModbusRequest>>,
        reply: ModbusResponse,
    }

    impl ScriptedClient {
        fn replying(reply: ModbusResponse) -> Self {
            Self { seen: Mutex::new(Vec::new()), reply }
        }

        fn seen(&self) -> Vec<ModbusRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModbusClient for ScriptedClient {
        async fn execute_request(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
            self.seen.lock().unwrap().push(request);
            self.reply.clone().into_result()
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> ModbusResult<()> {
            Ok(())
        }

        async fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[tokio::test]
    async fn test_read_registers() {
        let client = ScriptedClient::replying(ModbusResponse::ReadHoldingRegisters(vec![10, 20, 30]));
        assert_eq!(client.read_holding_registers(0, 3).await.unwrap(), vec![10, 20, 30]);
        assert_eq!(client.seen(), vec![ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 3 }]);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_not_executed() {
        let client = ScriptedClient::replying(ModbusResponse::ReadCoils(vec![]));

        assert!(matches!(client.read_01(0, 2001).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.read_03(0, 0).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.read_04(65535, 2).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.write_0f(0, &[true; 1969]).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.write_10(0, &[0; 124]).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.read_write_17(0, 1, 0, &[0; 122]).await, Err(ModbusError::InvalidArgument { .. })));
        assert!(matches!(client.write_05_raw(5, 0x1234).await, Err(ModbusError::InvalidArgument { .. })));

        assert!(client.seen().is_empty());
    }

    #[tokio::test]
    async fn test_write_single_coil_raw() {
        let client = ScriptedClient::replying(ModbusResponse::WriteSingleCoil { address: 5, value: true });
        client.write_05_raw(5, 0xFF00).await.unwrap();
        assert_eq!(client.seen(), vec![ModbusRequest::WriteSingleCoil { address: 5, value: true }]);
    }

    #[tokio::test]
    async fn test_exception_passthrough() {
        let client = ScriptedClient::replying(ModbusResponse::Exception {
            function: ModbusFunction::WriteMultipleRegisters,
            code: 0x04,
        });
        let result = client.write_multiple_registers(10, &[1, 2]).await;
        assert_eq!(result, Err(ModbusError::exception(0x10, 0x04)));
    }

    #[tokio::test]
    async fn test_mismatched_response_variant() {
        let client = ScriptedClient::replying(ModbusResponse::ReadInputRegisters(vec![1]));
        assert!(matches!(client.read_03(0, 1).await, Err(ModbusError::MalformedFrame { .. })));
    }
}
