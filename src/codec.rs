//! # Modbus PDU Codec
//!
//! Pure, stateless conversion between [`ModbusRequest`]/[`ModbusResponse`]
//! and Protocol Data Unit bytes (function code + payload). Transport framing
//! (MBAP header, RTU unit id and CRC) lives in [`crate::transport`].
//!
//! The client side uses [`encode_request`] and [`decode_response`]; the
//! device side ([`crate::simulator`]) uses [`decode_request`] and
//! [`encode_response`].
//!
//! ## PDU Layouts
//!
//! ```text
//! 0x01-0x04  request:  fc | addr:u16 | qty:u16
//!            response: fc | byte_count:u8 | data
//! 0x05/0x06  request:  fc | addr:u16 | value:u16      (response echoes)
//! 0x0F/0x10  request:  fc | addr:u16 | qty:u16 | byte_count:u8 | data
//!            response: fc | addr:u16 | qty:u16
//! 0x17       request:  fc | r_addr:u16 | r_qty:u16 | w_addr:u16 | w_qty:u16 | byte_count:u8 | data
//!            response: fc | byte_count:u8 | data
//! exception  response: fc | 0x80 | code:u8
//! ```

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    data_utils, ModbusFunction, ModbusRequest, ModbusResponse, EXCEPTION_FLAG,
};

/// Maximum PDU size (256-byte serial ADU minus unit id and CRC)
pub const MAX_PDU_SIZE: usize = 253;

/// Sequential big-endian reader over a PDU body
///
/// Running past the end of the buffer is a malformed frame.
struct PduReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PduReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(body) }
    }

    fn u8(&mut self, field: &str) -> ModbusResult<u8> {
        self.cursor
            .read_u8()
            .map_err(|_| ModbusError::malformed(format!("PDU truncated before {}", field)))
    }

    fn u16(&mut self, field: &str) -> ModbusResult<u16> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| ModbusError::malformed(format!("PDU truncated before {}", field)))
    }

    /// Read a byte-count prefixed block that must be exactly `expected` bytes
    fn counted_block(&mut self, expected: usize) -> ModbusResult<&'a [u8]> {
        let byte_count = self.u8("byte count")? as usize;
        if byte_count != expected {
            return Err(ModbusError::malformed(format!(
                "Byte count {} does not match expected {}", byte_count, expected
            )));
        }
        let start = self.cursor.position() as usize;
        let body: &'a [u8] = self.cursor.get_ref();
        let end = start + byte_count;
        if body.len() < end {
            return Err(ModbusError::malformed(format!(
                "Declared {} data bytes but only {} present", byte_count, body.len() - start
            )));
        }
        self.cursor.set_position(end as u64);
        Ok(&body[start..end])
    }

    /// Reject trailing bytes
    fn finish(self) -> ModbusResult<()> {
        let consumed = self.cursor.position() as usize;
        let total = self.cursor.get_ref().len();
        if consumed != total {
            return Err(ModbusError::malformed(format!(
                "PDU has {} trailing bytes", total - consumed
            )));
        }
        Ok(())
    }
}

/// Encode a request into PDU bytes
///
/// The request is validated first, so an out-of-range request never yields
/// bytes.
pub fn encode_request(request: &ModbusRequest) -> ModbusResult<Vec<u8>> {
    request.validate()?;

    let mut pdu = BytesMut::with_capacity(MAX_PDU_SIZE);
    pdu.put_u8(request.function().to_u8());

    match request {
        ModbusRequest::ReadCoils { address, quantity }
        | ModbusRequest::ReadDiscreteInputs { address, quantity }
        | ModbusRequest::ReadHoldingRegisters { address, quantity }
        | ModbusRequest::ReadInputRegisters { address, quantity } => {
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        },
        ModbusRequest::WriteSingleCoil { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(data_utils::coil_to_wire(*value));
        },
        ModbusRequest::WriteSingleRegister { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        },
        ModbusRequest::WriteMultipleCoils { address, values } => {
            let packed = data_utils::pack_bits(values);
            pdu.put_u16(*address);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8(packed.len() as u8);
            pdu.put_slice(&packed);
        },
        ModbusRequest::WriteMultipleRegisters { address, values } => {
            pdu.put_u16(*address);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8((values.len() * 2) as u8);
            pdu.put_slice(&data_utils::registers_to_bytes(values));
        },
        ModbusRequest::ReadWriteMultipleRegisters { read_address, read_quantity, write_address, values } => {
            pdu.put_u16(*read_address);
            pdu.put_u16(*read_quantity);
            pdu.put_u16(*write_address);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8((values.len() * 2) as u8);
            pdu.put_slice(&data_utils::registers_to_bytes(values));
        },
    }

    Ok(pdu.to_vec())
}

/// Decode response PDU bytes against the request that produced them
///
/// A function code equal to the request's code with the 0x80 bit set is an
/// exception response and decodes to [`ModbusResponse::Exception`]; callers
/// turn it into an error with [`ModbusResponse::into_result`].
pub fn decode_response(request: &ModbusRequest, pdu: &[u8]) -> ModbusResult<ModbusResponse> {
    let (&function_code, body) = pdu
        .split_first()
        .ok_or_else(|| ModbusError::malformed("Empty response PDU"))?;

    let function = request.function();
    let expected_code = function.to_u8();

    if function_code == expected_code | EXCEPTION_FLAG {
        if body.len() != 1 {
            return Err(ModbusError::malformed(format!(
                "Exception response must carry exactly one byte, got {}", body.len()
            )));
        }
        return Ok(ModbusResponse::Exception { function, code: body[0] });
    }

    if function_code != expected_code {
        return Err(ModbusError::malformed(format!(
            "Response function code 0x{:02X} does not match request 0x{:02X}",
            function_code, expected_code
        )));
    }

    let mut reader = PduReader::new(body);

    let response = match request {
        ModbusRequest::ReadCoils { quantity, .. } => {
            let data = reader.counted_block(data_utils::packed_len(*quantity as usize))?;
            ModbusResponse::ReadCoils(data_utils::unpack_bits(data, *quantity as usize))
        },
        ModbusRequest::ReadDiscreteInputs { quantity, .. } => {
            let data = reader.counted_block(data_utils::packed_len(*quantity as usize))?;
            ModbusResponse::ReadDiscreteInputs(data_utils::unpack_bits(data, *quantity as usize))
        },
        ModbusRequest::ReadHoldingRegisters { quantity, .. } => {
            let data = reader.counted_block(*quantity as usize * 2)?;
            ModbusResponse::ReadHoldingRegisters(data_utils::bytes_to_registers(data)?)
        },
        ModbusRequest::ReadInputRegisters { quantity, .. } => {
            let data = reader.counted_block(*quantity as usize * 2)?;
            ModbusResponse::ReadInputRegisters(data_utils::bytes_to_registers(data)?)
        },
        ModbusRequest::ReadWriteMultipleRegisters { read_quantity, .. } => {
            let data = reader.counted_block(*read_quantity as usize * 2)?;
            ModbusResponse::ReadWriteMultipleRegisters(data_utils::bytes_to_registers(data)?)
        },
        ModbusRequest::WriteSingleCoil { address, value } => {
            let echoed_address = reader.u16("address")?;
            let raw = reader.u16("coil value")?;
            let echoed_value = data_utils::coil_from_wire(raw).ok_or_else(|| {
                ModbusError::malformed(format!("Invalid coil value 0x{:04X}", raw))
            })?;
            check_echo("address", *address, echoed_address)?;
            check_echo("coil value", data_utils::coil_to_wire(*value), raw)?;
            ModbusResponse::WriteSingleCoil { address: echoed_address, value: echoed_value }
        },
        ModbusRequest::WriteSingleRegister { address, value } => {
            let echoed_address = reader.u16("address")?;
            let echoed_value = reader.u16("register value")?;
            check_echo("address", *address, echoed_address)?;
            check_echo("register value", *value, echoed_value)?;
            ModbusResponse::WriteSingleRegister { address: echoed_address, value: echoed_value }
        },
        ModbusRequest::WriteMultipleCoils { address, values } => {
            let echoed_address = reader.u16("address")?;
            let quantity = reader.u16("quantity")?;
            check_echo("address", *address, echoed_address)?;
            check_echo("quantity", values.len() as u16, quantity)?;
            ModbusResponse::WriteMultipleCoils { address: echoed_address, quantity }
        },
        ModbusRequest::WriteMultipleRegisters { address, values } => {
            let echoed_address = reader.u16("address")?;
            let quantity = reader.u16("quantity")?;
            check_echo("address", *address, echoed_address)?;
            check_echo("quantity", values.len() as u16, quantity)?;
            ModbusResponse::WriteMultipleRegisters { address: echoed_address, quantity }
        },
    };

    reader.finish()?;
    Ok(response)
}

fn check_echo(field: &str, expected: u16, actual: u16) -> ModbusResult<()> {
    if expected != actual {
        return Err(ModbusError::malformed(format!(
            "Echoed {} 0x{:04X} does not match request 0x{:04X}", field, actual, expected
        )));
    }
    Ok(())
}

/// Decode request PDU bytes (device side)
///
/// Unsupported function codes fail with `Unsupported`; structural problems
/// with `MalformedFrame`; protocol limit violations with `InvalidArgument`.
pub fn decode_request(pdu: &[u8]) -> ModbusResult<ModbusRequest> {
    let (&function_code, body) = pdu
        .split_first()
        .ok_or_else(|| ModbusError::malformed("Empty request PDU"))?;

    let function = ModbusFunction::from_u8(function_code)?;
    let mut reader = PduReader::new(body);

    let request = match function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => {
            let address = reader.u16("address")?;
            let quantity = reader.u16("quantity")?;
            match function {
                ModbusFunction::ReadCoils => ModbusRequest::ReadCoils { address, quantity },
                ModbusFunction::ReadDiscreteInputs => ModbusRequest::ReadDiscreteInputs { address, quantity },
                ModbusFunction::ReadHoldingRegisters => ModbusRequest::ReadHoldingRegisters { address, quantity },
                _ => ModbusRequest::ReadInputRegisters { address, quantity },
            }
        },
        ModbusFunction::WriteSingleCoil => {
            let address = reader.u16("address")?;
            let raw = reader.u16("coil value")?;
            let value = data_utils::coil_from_wire(raw).ok_or_else(|| {
                ModbusError::malformed(format!("Invalid coil value 0x{:04X}", raw))
            })?;
            ModbusRequest::WriteSingleCoil { address, value }
        },
        ModbusFunction::WriteSingleRegister => {
            let address = reader.u16("address")?;
            let value = reader.u16("register value")?;
            ModbusRequest::WriteSingleRegister { address, value }
        },
        ModbusFunction::WriteMultipleCoils => {
            let address = reader.u16("address")?;
            let quantity = reader.u16("quantity")? as usize;
            let data = reader.counted_block(data_utils::packed_len(quantity))?;
            ModbusRequest::WriteMultipleCoils { address, values: data_utils::unpack_bits(data, quantity) }
        },
        ModbusFunction::WriteMultipleRegisters => {
            let address = reader.u16("address")?;
            let quantity = reader.u16("quantity")? as usize;
            let data = reader.counted_block(quantity * 2)?;
            ModbusRequest::WriteMultipleRegisters { address, values: data_utils::bytes_to_registers(data)? }
        },
        ModbusFunction::ReadWriteMultipleRegisters => {
            let read_address = reader.u16("read address")?;
            let read_quantity = reader.u16("read quantity")?;
            let write_address = reader.u16("write address")?;
            let write_quantity = reader.u16("write quantity")? as usize;
            let data = reader.counted_block(write_quantity * 2)?;
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values: data_utils::bytes_to_registers(data)?,
            }
        },
    };

    reader.finish()?;
    request.validate()?;
    Ok(request)
}

/// Encode a response into PDU bytes (device side)
pub fn encode_response(response: &ModbusResponse) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(MAX_PDU_SIZE);

    match response {
        ModbusResponse::Exception { function, code } => {
            pdu.put_u8(function.to_u8() | EXCEPTION_FLAG);
            pdu.put_u8(*code);
            return pdu.to_vec();
        },
        _ => pdu.put_u8(response.function().to_u8()),
    }

    match response {
        ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
            let packed = data_utils::pack_bits(bits);
            pdu.put_u8(packed.len() as u8);
            pdu.put_slice(&packed);
        },
        ModbusResponse::ReadHoldingRegisters(values)
        | ModbusResponse::ReadInputRegisters(values)
        | ModbusResponse::ReadWriteMultipleRegisters(values) => {
            pdu.put_u8((values.len() * 2) as u8);
            pdu.put_slice(&data_utils::registers_to_bytes(values));
        },
        ModbusResponse::WriteSingleCoil { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(data_utils::coil_to_wire(*value));
        },
        ModbusResponse::WriteSingleRegister { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        },
        ModbusResponse::WriteMultipleCoils { address, quantity }
        | ModbusResponse::WriteMultipleRegisters { address, quantity } => {
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        },
        ModbusResponse::Exception { .. } => {},
    }

    pdu.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_read_request() {
        let request = ModbusRequest::ReadHoldingRegisters { address: 0x006B, quantity: 3 };
        assert_eq!(encode_request(&request).unwrap(), vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_encode_write_single_coil() {
        let on = ModbusRequest::WriteSingleCoil { address: 5, value: true };
        assert_eq!(encode_request(&on).unwrap(), vec![0x05, 0x00, 0x05, 0xFF, 0x00]);

        let off = ModbusRequest::WriteSingleCoil { address: 5, value: false };
        assert_eq!(encode_request(&off).unwrap(), vec![0x05, 0x00, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_write_multiple_coils() {
        // Coils 20-29: 1 0 1 1 0 0 1 1 | 1 0
        let values = vec![true, false, true, true, false, false, true, true, true, false];
        let request = ModbusRequest::WriteMultipleCoils { address: 0x0013, values };
        assert_eq!(
            encode_request(&request).unwrap(),
            vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_encode_read_write_multiple_registers() {
        let request = ModbusRequest::ReadWriteMultipleRegisters {
            read_address: 0x0003,
            read_quantity: 6,
            write_address: 0x000E,
            values: vec![0x00FF, 0x00FF, 0x00FF],
        };
        assert_eq!(
            encode_request(&request).unwrap(),
            vec![
                0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x03, 0x06,
                0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF,
            ]
        );
    }

    #[test]
    fn test_encode_rejects_invalid_request() {
        let request = ModbusRequest::ReadCoils { address: 0, quantity: 2001 };
        assert!(matches!(encode_request(&request), Err(ModbusError::InvalidArgument { .. })));
    }

    #[test]
    fn test_decode_register_response() {
        let request = ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 3 };
        let pdu = [0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E];
        assert_eq!(
            decode_response(&request, &pdu).unwrap(),
            ModbusResponse::ReadHoldingRegisters(vec![10, 20, 30])
        );
    }

    #[test]
    fn test_decode_coil_response_truncates_padding() {
        let request = ModbusRequest::ReadCoils { address: 0, quantity: 3 };
        let pdu = [0x01, 0x01, 0b1111_1101];
        assert_eq!(
            decode_response(&request, &pdu).unwrap(),
            ModbusResponse::ReadCoils(vec![true, false, true])
        );
    }

    #[test]
    fn test_decode_exception_response() {
        let request = ModbusRequest::ReadInputRegisters { address: 0, quantity: 1 };
        let response = decode_response(&request, &[0x84, 0x02]).unwrap();
        assert_eq!(
            response,
            ModbusResponse::Exception { function: ModbusFunction::ReadInputRegisters, code: 0x02 }
        );
        assert_eq!(response.into_result(), Err(ModbusError::exception(0x04, 0x02)));

        // Unknown codes survive verbatim
        let response = decode_response(&request, &[0x84, 0x0C]).unwrap();
        assert!(matches!(response, ModbusResponse::Exception { code: 0x0C, .. }));
    }

    #[test]
    fn test_decode_exception_with_wrong_length() {
        let request = ModbusRequest::ReadInputRegisters { address: 0, quantity: 1 };
        assert!(matches!(decode_response(&request, &[0x84]), Err(ModbusError::MalformedFrame { .. })));
        assert!(matches!(decode_response(&request, &[0x84, 0x02, 0x00]), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_decode_rejects_other_function_exception() {
        let request = ModbusRequest::ReadInputRegisters { address: 0, quantity: 1 };
        assert!(matches!(decode_response(&request, &[0x83, 0x02]), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_decode_rejects_mismatches() {
        let request = ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 2 };

        // Wrong function code
        assert!(decode_response(&request, &[0x04, 0x04, 0, 1, 0, 2]).is_err());
        // Byte count disagrees with quantity
        assert!(decode_response(&request, &[0x03, 0x02, 0, 1]).is_err());
        // Declared more bytes than present
        assert!(decode_response(&request, &[0x03, 0x04, 0, 1]).is_err());
        // Trailing bytes
        assert!(decode_response(&request, &[0x03, 0x04, 0, 1, 0, 2, 0xFF]).is_err());
        // Empty
        assert!(decode_response(&request, &[]).is_err());
    }

    #[test]
    fn test_decode_write_echo() {
        let request = ModbusRequest::WriteSingleRegister { address: 1, value: 3 };
        assert_eq!(
            decode_response(&request, &[0x06, 0x00, 0x01, 0x00, 0x03]).unwrap(),
            ModbusResponse::WriteSingleRegister { address: 1, value: 3 }
        );
        assert!(decode_response(&request, &[0x06, 0x00, 0x01, 0x00, 0x04]).is_err());

        let request = ModbusRequest::WriteSingleCoil { address: 7, value: true };
        assert!(decode_response(&request, &[0x05, 0x00, 0x07, 0xFF, 0x00]).is_ok());
        assert!(matches!(
            decode_response(&request, &[0x05, 0x00, 0x07, 0x12, 0x34]),
            Err(ModbusError::MalformedFrame { .. })
        ));

        let request = ModbusRequest::WriteMultipleRegisters { address: 1, values: vec![10, 258] };
        assert_eq!(
            decode_response(&request, &[0x10, 0x00, 0x01, 0x00, 0x02]).unwrap(),
            ModbusResponse::WriteMultipleRegisters { address: 1, quantity: 2 }
        );
        assert!(decode_response(&request, &[0x10, 0x00, 0x01, 0x00, 0x03]).is_err());
    }

    #[test]
    fn test_request_round_trip() {
        let requests = vec![
            ModbusRequest::ReadCoils { address: 19, quantity: 37 },
            ModbusRequest::ReadDiscreteInputs { address: 196, quantity: 22 },
            ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 125 },
            ModbusRequest::ReadInputRegisters { address: 65535, quantity: 1 },
            ModbusRequest::WriteSingleCoil { address: 172, value: true },
            ModbusRequest::WriteSingleCoil { address: 173, value: false },
            ModbusRequest::WriteSingleRegister { address: 1, value: 0xBEEF },
            ModbusRequest::WriteMultipleCoils { address: 19, values: vec![true; 1968] },
            ModbusRequest::WriteMultipleRegisters { address: 1, values: (0..123).collect() },
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address: 3,
                read_quantity: 6,
                write_address: 14,
                values: vec![0x00FF, 0x0100, 0xFFFF],
            },
        ];

        for request in requests {
            let pdu = encode_request(&request).unwrap();
            assert_eq!(decode_request(&pdu).unwrap(), request);
        }
    }

    #[test]
    fn test_response_round_trip() {
        let cases = vec![
            (
                ModbusRequest::ReadCoils { address: 0, quantity: 10 },
                ModbusResponse::ReadCoils(vec![true, false, true, true, false, false, true, true, true, false]),
            ),
            (
                ModbusRequest::ReadInputRegisters { address: 8, quantity: 1 },
                ModbusResponse::ReadInputRegisters(vec![0x000A]),
            ),
            (
                ModbusRequest::WriteMultipleCoils { address: 19, values: vec![true; 10] },
                ModbusResponse::WriteMultipleCoils { address: 19, quantity: 10 },
            ),
            (
                ModbusRequest::ReadWriteMultipleRegisters {
                    read_address: 3, read_quantity: 2, write_address: 14, values: vec![1],
                },
                ModbusResponse::ReadWriteMultipleRegisters(vec![0x00FE, 0x0ACD]),
            ),
            (
                ModbusRequest::ReadCoils { address: 0, quantity: 10 },
                ModbusResponse::Exception { function: ModbusFunction::ReadCoils, code: 0x04 },
            ),
        ];

        for (request, response) in cases {
            let pdu = encode_response(&response);
            assert_eq!(decode_response(&request, &pdu).unwrap(), response);
        }
    }

    #[test]
    fn test_decode_request_errors() {
        assert!(matches!(decode_request(&[0x08, 0x00, 0x00]), Err(ModbusError::Unsupported { code: 0x08, .. })));
        assert!(matches!(decode_request(&[0x03, 0x00]), Err(ModbusError::MalformedFrame { .. })));
        assert!(matches!(
            decode_request(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            Err(ModbusError::InvalidArgument { .. })
        ));
    }
}
