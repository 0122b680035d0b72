//! Integration Tests for the Modbus Engine
//!
//! These tests run a client `Connection` against a `DeviceSimulator` over
//! in-memory duplex streams, exercising codec, framing, transaction
//! handling and the client API together.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use modbus_engine::transport::{encode_rtu_frame, frame_gap, read_rtu_frame};
use modbus_engine::*;

const RTU_BAUD: u32 = 115200;

fn seeded_device() -> DeviceSimulator {
    modbus_engine::utils::logging::init_test_logger();
    let bank = Arc::new(ModbusRegisterBank::with_size(1000));
    bank.write_10(0, &[10, 20, 30]).unwrap();
    bank.set_input_registers(0, &[1000, 1001]).unwrap();
    bank.set_discrete_input(3, true).unwrap();
    DeviceSimulator::new(1, bank)
}

/// Client connection wired to a simulator serving MBAP frames
fn tcp_connection(device: &DeviceSimulator) -> Connection<TcpTransport> {
    let (client, server) = duplex(4096);
    let device = device.clone();
    tokio::spawn(async move {
        let _ = device.serve_tcp(server).await;
    });
    Connection::new(TcpTransport::from_stream(client)).with_timeout(Duration::from_secs(2))
}

/// Client connection wired to a simulator serving RTU frames
fn rtu_connection(device: &DeviceSimulator) -> Connection<RtuTransport> {
    let (client, server) = duplex(4096);
    let device = device.clone();
    tokio::spawn(async move {
        let _ = device.serve_rtu(server, RTU_BAUD).await;
    });
    Connection::new(RtuTransport::from_stream(client, RTU_BAUD)).with_timeout(Duration::from_secs(2))
}

/// Run every supported operation against the simulator
async fn exercise_all_functions<C: ModbusClient>(client: &C, bank: &ModbusRegisterBank) {
    assert_eq!(client.read_holding_registers(0, 3).await.unwrap(), vec![10, 20, 30]);
    assert_eq!(client.read_input_registers(0, 2).await.unwrap(), vec![1000, 1001]);
    assert_eq!(client.read_discrete_inputs(2, 3).await.unwrap(), vec![false, true, false]);

    client.write_single_coil(5, true).await.unwrap();
    client.write_multiple_coils(10, &[true, false, true, true]).await.unwrap();
    assert_eq!(client.read_coils(5, 1).await.unwrap(), vec![true]);
    assert_eq!(client.read_coils(10, 4).await.unwrap(), vec![true, false, true, true]);

    client.write_single_register(100, 0x1234).await.unwrap();
    client.write_multiple_registers(200, &[1, 2, 3]).await.unwrap();
    assert_eq!(bank.read_03(100, 1).unwrap(), vec![0x1234]);
    assert_eq!(bank.read_03(200, 3).unwrap(), vec![1, 2, 3]);

    // The write lands before the read
    let values = client.read_write_multiple_registers(0, 3, 1, &[21, 31]).await.unwrap();
    assert_eq!(values, vec![10, 21, 31]);
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let device = seeded_device();
    let connection = tcp_connection(&device);

    exercise_all_functions(&connection, &device.register_bank()).await;

    let metrics = connection.metrics().await;
    assert_eq!(metrics.successful_requests, 10);
    assert_eq!(metrics.failed_requests, 0);
    assert_eq!(connection.next_transaction_id().await, 11);
    assert_eq!(device.get_stats().await.total_requests, 10);
}

#[tokio::test]
async fn test_rtu_end_to_end() {
    let device = seeded_device();
    let connection = rtu_connection(&device);

    exercise_all_functions(&connection, &device.register_bank()).await;

    let stats = connection.get_stats().await;
    assert_eq!(stats.requests_sent, 10);
    assert_eq!(stats.responses_received, 10);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn test_device_exception_keeps_connection_usable() {
    let device = seeded_device();
    let connection = tcp_connection(&device);

    // The bank has 1000 addresses
    let result = connection.read_holding_registers(999, 2).await;
    assert_eq!(result, Err(ModbusError::exception(0x03, 0x02)));
    assert_eq!(result.unwrap_err().exception_code(), Some(0x02));

    assert_eq!(connection.state(), ConnectionState::Idle);
    assert_eq!(connection.read_holding_registers(0, 1).await.unwrap(), vec![10]);
}

#[tokio::test]
async fn test_rtu_device_exception() {
    let device = seeded_device();
    let connection = rtu_connection(&device);

    let result = connection.write_multiple_coils(998, &[true, true, true]).await;
    assert_eq!(result, Err(ModbusError::exception(0x0F, 0x02)));
    assert_eq!(connection.read_coils(0, 1).await.unwrap(), vec![false]);
}

#[tokio::test]
async fn test_second_dispatch_is_rejected_while_busy() {
    let device = seeded_device().with_response_delay(Duration::from_millis(100));
    let connection = tcp_connection(&device);

    let (first, second) = tokio::join!(
        connection.read_holding_registers(0, 1),
        connection.read_holding_registers(1, 1),
    );

    assert_eq!(first.unwrap(), vec![10]);
    assert_eq!(second, Err(ModbusError::ConnectionBusy { transaction_id: 1 }));
    assert_eq!(device.get_stats().await.total_requests, 1);
}

#[tokio::test]
async fn test_timeout_then_immediate_dispatch() {
    let device = seeded_device().with_response_delay(Duration::from_millis(150));
    let connection = tcp_connection(&device);

    let started = tokio::time::Instant::now();
    let result = connection
        .dispatch_with_timeout(ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 1 }, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ModbusError::Timeout { timeout_ms: 50, .. })));
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(connection.state(), ConnectionState::Idle);

    // The late answer to transaction 1 is discarded, not returned here
    let values = connection.read_holding_registers(1, 2).await.unwrap();
    assert_eq!(values, vec![20, 30]);

    let metrics = connection.metrics().await;
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.successful_requests, 1);
}

#[tokio::test]
async fn test_rtu_timeout_then_immediate_dispatch() {
    let device = seeded_device().with_response_delay(Duration::from_millis(150));
    device.register_bank().write_10(100, &[7, 8, 9]).unwrap();
    let connection = rtu_connection(&device);

    let result = connection
        .dispatch_with_timeout(ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 3 }, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ModbusError::Timeout { timeout_ms: 50, .. })));
    assert_eq!(connection.state(), ConnectionState::Idle);

    // Same quantity, so only the line discipline keeps [10, 20, 30] out of this answer
    let response = connection
        .dispatch(ModbusRequest::ReadHoldingRegisters { address: 100, quantity: 3 })
        .await
        .unwrap();
    assert_eq!(response, ModbusResponse::ReadHoldingRegisters(vec![7, 8, 9]));
    assert_eq!(device.get_stats().await.total_requests, 2);
}

#[tokio::test]
async fn test_rtu_line_held_until_late_response() {
    let device = seeded_device().with_response_delay(Duration::from_millis(300));
    let connection = rtu_connection(&device);
    let short = Duration::from_millis(50);

    let first = connection
        .dispatch_with_timeout(ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 1 }, short)
        .await;
    assert!(matches!(first, Err(ModbusError::Timeout { .. })));

    // The device has not answered yet, so nothing may go out
    let second = connection
        .dispatch_with_timeout(ModbusRequest::ReadHoldingRegisters { address: 1, quantity: 1 }, short)
        .await;
    assert!(matches!(second, Err(ModbusError::Timeout { .. })));
    assert_eq!(connection.transport_stats().await.requests_sent, 1);

    assert_eq!(connection.read_holding_registers(2, 1).await.unwrap(), vec![30]);
    assert_eq!(connection.transport_stats().await.requests_sent, 2);
}

#[tokio::test]
async fn test_broadcast_unit_is_rejected_before_the_device() {
    let device = seeded_device();
    let connection = tcp_connection(&device).with_unit_id(0);

    let result = connection.write_single_register(5, 42).await;
    assert!(matches!(result, Err(ModbusError::InvalidArgument { .. })));
    assert_eq!(device.get_stats().await.total_requests, 0);
    assert_eq!(device.register_bank().read_03(5, 1).unwrap(), vec![0]);
}

#[tokio::test]
async fn test_cancelled_dispatch_releases_connection() {
    let device = seeded_device().with_response_delay(Duration::from_millis(100));
    let connection = tcp_connection(&device);

    let cancelled = timeout(Duration::from_millis(20), connection.read_holding_registers(0, 3)).await;
    assert!(cancelled.is_err());
    assert_eq!(connection.state(), ConnectionState::Idle);

    let values = connection.read_input_registers(0, 2).await.unwrap();
    assert_eq!(values, vec![1000, 1001]);
    assert_eq!(connection.next_transaction_id().await, 3);
}

#[tokio::test]
async fn test_connection_lost_when_device_goes_away() {
    let (client, server) = duplex(1024);
    let connection = Connection::new(TcpTransport::from_stream(client));
    drop(server);

    let result = connection.read_coils(0, 8).await;
    assert!(matches!(result, Err(ModbusError::ConnectionLost { .. })));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_connected());

    let result = connection.read_coils(0, 8).await;
    assert!(matches!(result, Err(ModbusError::ConnectionLost { .. })));
    assert!(matches!(connection.reconnect().await, Err(ModbusError::ConnectionLost { .. })));
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_device() {
    let device = seeded_device();
    let connection = tcp_connection(&device);

    let results = vec![
        connection.read_coils(0, 0).await.map(|_| ()),
        connection.read_coils(0, 2001).await.map(|_| ()),
        connection.read_discrete_inputs(65535, 2).await.map(|_| ()),
        connection.read_holding_registers(0, 126).await.map(|_| ()),
        connection.read_input_registers(65500, 100).await.map(|_| ()),
        connection.write_multiple_coils(0, &vec![true; 1969]).await,
        connection.write_multiple_coils(0, &[]).await,
        connection.write_multiple_registers(0, &vec![0; 124]).await,
        connection.read_write_multiple_registers(0, 1, 0, &vec![0; 122]).await.map(|_| ()),
        connection.write_05_raw(0, 0x00FF).await,
    ];
    for result in results {
        assert!(matches!(result, Err(ModbusError::InvalidArgument { .. })), "{:?}", result);
    }

    assert_eq!(connection.get_stats().await.requests_sent, 0);
    assert_eq!(connection.next_transaction_id().await, 1);
    assert_eq!(device.get_stats().await.total_requests, 0);
}

#[tokio::test]
async fn test_boundary_quantities_are_accepted() {
    let device = DeviceSimulator::new(1, Arc::new(ModbusRegisterBank::new()));
    let connection = tcp_connection(&device);

    assert_eq!(connection.read_coils(0, 2000).await.unwrap().len(), 2000);
    assert_eq!(connection.read_holding_registers(65410, 125).await.unwrap().len(), 125);
    connection.write_multiple_coils(0, &vec![true; 1968]).await.unwrap();
    connection.write_multiple_registers(0, &vec![7; 123]).await.unwrap();
    assert_eq!(connection.read_write_multiple_registers(0, 125, 0, &vec![9; 121]).await.unwrap()[120], 9);
    assert_eq!(connection.read_coils(1967, 2).await.unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_rtu_crc_error_then_recovery() {
    let (client, mut line) = duplex(1024);
    let connection = Connection::new(RtuTransport::from_stream(client, RTU_BAUD))
        .with_timeout(Duration::from_secs(1));

    let device = tokio::spawn(async move {
        let gap = frame_gap(RTU_BAUD);

        // First answer arrives with a corrupted CRC
        let request = read_rtu_frame(&mut line, gap).await.unwrap();
        assert_eq!(request, encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        let mut corrupted = encode_rtu_frame(1, &[0x03, 0x02, 0x00, 0x0A]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        line.write_all(&corrupted).await.unwrap();

        let _ = read_rtu_frame(&mut line, gap).await.unwrap();
        line.write_all(&encode_rtu_frame(1, &[0x03, 0x02, 0x00, 0x0B])).await.unwrap();
        line
    });

    let result = connection.read_holding_registers(0, 1).await;
    assert!(matches!(result, Err(ModbusError::CrcMismatch { .. })));
    assert_eq!(connection.state(), ConnectionState::Idle);

    assert_eq!(connection.read_holding_registers(0, 1).await.unwrap(), vec![11]);
    device.await.unwrap();
}

#[tokio::test]
async fn test_stale_tcp_frame_is_skipped() {
    let (client, mut device) = duplex(1024);
    let connection = Connection::new(TcpTransport::from_stream(client))
        .with_transaction_ids(TransactionIdCounter::starting_at(7));

    let peer = tokio::spawn(async move {
        let mut request = [0u8; 12];
        device.read_exact(&mut request).await.unwrap();
        assert_eq!(request[..2], [0x00, 0x07]);

        // A frame for transaction 6 first, then the real answer
        device.write_all(&[0x00, 0x06, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x63]).await.unwrap();
        device.write_all(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A]).await.unwrap();
        device
    });

    assert_eq!(connection.read_holding_registers(0, 1).await.unwrap(), vec![42]);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_unit_id_addressing() {
    let device = DeviceSimulator::new(17, seeded_device().register_bank());
    let (client, server) = duplex(1024);
    tokio::spawn({
        let device = device.clone();
        async move { device.serve_tcp(server).await }
    });

    let connection = Connection::new(TcpTransport::from_stream(client)).with_unit_id(17);
    assert_eq!(connection.unit_id(), 17);
    assert_eq!(connection.read_holding_registers(0, 1).await.unwrap(), vec![10]);

    // A device that ignores the frame leaves the client to time out
    let other = tcp_connection(&DeviceSimulator::new(2, Arc::new(ModbusRegisterBank::new())))
        .with_timeout(Duration::from_millis(50));
    assert!(matches!(other.read_coils(0, 1).await, Err(ModbusError::Timeout { .. })));
}

#[tokio::test]
async fn test_callback_logger_sees_transactions() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback: LogCallback = Box::new(move |level, message| {
        sink.lock().unwrap().push((level, message.to_string()));
    });

    let device = seeded_device();
    let connection = tcp_connection(&device)
        .with_logger(CallbackLogger::new(Some(callback), LogLevel::Info));

    connection.read_holding_registers(0, 3).await.unwrap();
    let _ = connection.read_holding_registers(999, 2).await;

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].1.starts_with("Modbus Request -> Unit: 1, Transaction: 1"));
    assert!(lines[1].1.contains("Registers: [10, 20, 30]"));
    assert!(lines[3].1.contains("Exception"));
}

#[tokio::test]
async fn test_close_disconnects() {
    let device = seeded_device();
    let connection = tcp_connection(&device);
    assert_eq!(connection.read_coils(0, 1).await.unwrap(), vec![false]);

    ModbusClient::close(&connection).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(device.get_stats().await.connections_count, 1);
}

#[test]
fn test_unsupported_functions_are_reported() {
    for code in [0x08, 0x0B, 0x11, 0x16, 0x2B] {
        assert!(matches!(ModbusFunction::from_u8(code), Err(ModbusError::Unsupported { .. })));
    }
    assert!(matches!(ModbusFunction::from_u8(0x99), Err(ModbusError::Unsupported { .. })));
}
