//! # Connection and Transaction Dispatch
//!
//! A [`Connection`] owns one transport and runs at most one transaction on
//! it at a time. `dispatch` is the single path every client operation takes:
//!
//! 1. validate the request (nothing touches the wire on failure)
//! 2. take the busy flag, or fail at once with `ConnectionBusy`
//! 3. drop any abandoned transaction and drain stale input; on RTU, wait
//!    out the late answer to a timed-out request before sending again
//! 4. allocate a transaction id and record the transaction as pending
//! 5. encode, send, and wait for a matching frame until the deadline
//! 6. decode, resolve, clear the slot
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──reconnect──► Idle ⇄ AwaitingResponse
//!      ▲                                │
//!      └──────── transport failure ─────┘
//! ```
//!
//! Dropping a dispatch future releases the busy flag immediately. The
//! transaction it leaves in the slot is discarded by the next dispatch.
//!
//! RTU frames carry no transaction id, so a request that timed out leaves
//! the line owing a response. The next dispatch drains that response, or
//! waits until the late-response window closes, before it transmits.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};
use crate::transaction::{Correlation, Transaction, TransactionIdCounter};
use crate::transport::{ModbusTransport, RtuTransport, SerialConfig, TcpTransport, TransportKind, TransportStats};
use crate::utils::{format, validation, OperationTimer, PerformanceMetrics};

/// Default unit id for new connections
pub const DEFAULT_UNIT_ID: SlaveId = 1;

/// Observable state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is closed; dispatch fails until `reconnect`
    Disconnected,
    /// Connected with no transaction in flight
    Idle,
    /// A transaction is in flight
    AwaitingResponse,
}

struct ConnectionInner<T> {
    transport: T,
    ids: TransactionIdCounter,
    /// The in-flight transaction; still set here after a cancelled dispatch
    pending: Option<Transaction>,
    /// Input may hold the remains of a timed-out or broken exchange
    stale_input: bool,
    /// RTU: a timed-out request may still be answered until this instant
    owed_until: Option<Instant>,
    metrics: PerformanceMetrics,
    logger: CallbackLogger,
}

impl<T: ModbusTransport> ConnectionInner<T> {
    /// Close the transport after a channel failure
    async fn lose_transport(&mut self, error: ModbusError) -> ModbusError {
        let message = match error {
            ModbusError::Transport { message } | ModbusError::ConnectionLost { message } => message,
            other => other.to_string(),
        };
        warn!("Closing {} transport after channel failure: {}", self.transport.kind(), message);

        if let Err(e) = self.transport.close().await {
            debug!("Error while closing transport: {}", e);
        }
        self.pending = None;
        self.stale_input = false;
        self.owed_until = None;
        ModbusError::connection_lost(message)
    }

    /// Clear anything earlier transactions left on the channel
    ///
    /// While an RTU response is owed, waits for it at most `timeout`. If the
    /// window is still open afterwards nothing may be sent, and the new
    /// transaction fails with `Timeout`.
    async fn settle_input(&mut self, timeout: Duration) -> ModbusResult<()> {
        if let Some(owed_until) = self.owed_until {
            let wait = owed_until.saturating_duration_since(Instant::now()).min(timeout);
            let drained = match self.transport.discard_input(wait).await {
                Ok(n) => n,
                Err(e) => return Err(self.lose_transport(e).await),
            };
            if drained == 0 && Instant::now() < owed_until {
                return Err(ModbusError::timeout(
                    "waiting for a late response on the serial line",
                    timeout.as_millis() as u64,
                ));
            }
            if drained > 0 {
                debug!("Drained {} bytes of a late response", drained);
            }
            self.owed_until = None;
            self.stale_input = false;
        } else if self.stale_input {
            match self.transport.discard_input(Duration::ZERO).await {
                Ok(0) => {},
                Ok(n) => debug!("Drained {} stale units of input", n),
                Err(e) => return Err(self.lose_transport(e).await),
            }
            self.stale_input = false;
        }
        Ok(())
    }
}

/// Holds the busy flag; dropping it, even with a cancelled future, frees
/// the connection
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A Modbus connection: one transport, one transaction at a time
///
/// # Examples
///
/// ```rust,no_run
/// use modbus_engine::{Connection, ModbusRequest, ModbusResponse};
/// use std::time::Duration;
///
/// # async fn example() -> modbus_engine::ModbusResult<()> {
/// let connection = Connection::connect_tcp("127.0.0.1:502", Duration::from_secs(5))
///     .await?
///     .with_unit_id(1);
///
/// let response = connection
///     .dispatch(ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 3 })
///     .await?;
/// if let ModbusResponse::ReadHoldingRegisters(values) = response {
///     println!("{:?}", values);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Connection<T: ModbusTransport> {
    inner: Mutex<ConnectionInner<T>>,
    /// Set for exactly as long as a dispatch runs
    busy: AtomicBool,
    /// Transport state as of the last dispatch, close or reconnect
    connected: AtomicBool,
    /// Id of the most recent transaction, reported in `ConnectionBusy`
    in_flight: AtomicU16,
    kind: TransportKind,
    unit_id: SlaveId,
    default_timeout: Duration,
    late_response_window: Option<Duration>,
}

impl Connection<TcpTransport> {
    /// Connect to a Modbus TCP device at `host:port`
    ///
    /// `timeout` bounds the connect and becomes the default transaction
    /// timeout.
    pub async fn connect_tcp(address: impl Into<String>, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::connect(address, timeout).await?;
        Ok(Self::new(transport).with_timeout(timeout))
    }
}

impl Connection<RtuTransport> {
    /// Open a serial line for Modbus RTU
    pub fn open_rtu(config: SerialConfig) -> ModbusResult<Self> {
        Ok(Self::new(RtuTransport::open(config)?))
    }
}

impl<T: ModbusTransport> Connection<T> {
    /// Wrap a transport with unit id 1 and the default timeout
    pub fn new(transport: T) -> Self {
        let kind = transport.kind();
        let connected = transport.is_connected();
        Self {
            inner: Mutex::new(ConnectionInner {
                transport,
                ids: TransactionIdCounter::new(),
                pending: None,
                stale_input: false,
                owed_until: None,
                metrics: PerformanceMetrics::new(),
                logger: CallbackLogger::disabled(),
            }),
            busy: AtomicBool::new(false),
            connected: AtomicBool::new(connected),
            in_flight: AtomicU16::new(0),
            kind,
            unit_id: DEFAULT_UNIT_ID,
            default_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            late_response_window: None,
        }
    }

    /// Address requests to `unit_id`
    ///
    /// Must be 1-247 or 255; anything else makes every dispatch fail with
    /// `InvalidArgument`. Broadcast (0) is not supported since every
    /// transaction waits for a response.
    pub fn with_unit_id(mut self, unit_id: SlaveId) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Timeout applied by `dispatch`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// How long an RTU line stays reserved for the answer to a timed-out
    /// request; defaults to the connection timeout
    pub fn with_late_response_window(mut self, window: Duration) -> Self {
        self.late_response_window = Some(window);
        self
    }

    fn late_response_window(&self) -> Duration {
        self.late_response_window.unwrap_or(self.default_timeout)
    }

    /// Send request/response traffic to a callback logger
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.inner.get_mut().logger = logger;
        self
    }

    /// Replace the id counter, e.g. `TransactionIdCounter::starting_at(n)`
    pub fn with_transaction_ids(mut self, ids: TransactionIdCounter) -> Self {
        self.inner.get_mut().ids = ids;
        self
    }

    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Current state without waiting
    ///
    /// `AwaitingResponse` only while a dispatch is running; reading metrics
    /// or statistics does not count.
    pub fn state(&self) -> ConnectionState {
        if !self.connected.load(Ordering::Acquire) {
            ConnectionState::Disconnected
        } else if self.busy.load(Ordering::Acquire) {
            ConnectionState::AwaitingResponse
        } else {
            ConnectionState::Idle
        }
    }

    /// Dispatch a request with the connection's default timeout
    pub async fn dispatch(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.dispatch_with_timeout(request, self.default_timeout).await
    }

    /// Dispatch a request and wait at most `timeout` for its response
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for requests outside protocol limits, a zero
    ///   timeout or a unit id outside 1-247/255
    /// - `ConnectionBusy` when another transaction is in flight
    /// - `ConnectionLost` when the connection is, or becomes, disconnected
    /// - `Timeout` when no matching response arrives in time, or when an
    ///   RTU line is still owed a late response
    /// - `MalformedFrame` / `CrcMismatch` for undecodable responses
    /// - `Exception` when the device answers with an exception
    pub async fn dispatch_with_timeout(
        &self,
        request: ModbusRequest,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        request.validate()?;
        validation::validate_unit_id(self.unit_id)?;
        if timeout.is_zero() {
            return Err(ModbusError::invalid_argument("Transaction timeout must be greater than zero"));
        }

        let _busy = BusyGuard::acquire(&self.busy)
            .ok_or_else(|| ModbusError::busy(self.in_flight.load(Ordering::Acquire)))?;
        let mut guard = self.inner.lock().await;
        let result = self.run(&mut guard, request, timeout).await;
        self.connected.store(guard.transport.is_connected(), Ordering::Release);
        result
    }

    async fn run(
        &self,
        inner: &mut ConnectionInner<T>,
        request: ModbusRequest,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        if !inner.transport.is_connected() {
            return Err(ModbusError::connection_lost("Connection is closed; reconnect before dispatching"));
        }

        if let Some(abandoned) = inner.pending.take() {
            warn!("Discarding abandoned transaction {}", abandoned.id());
            inner.stale_input = true;
            if self.kind == TransportKind::Rtu {
                inner.owed_until = Some(Instant::now() + self.late_response_window());
            }
        }
        inner.settle_input(timeout).await?;

        let pdu = codec::encode_request(&request)?;
        let id = inner.ids.next_id();
        self.in_flight.store(id, Ordering::Release);
        inner.logger.log_request(self.unit_id, id, &request, &pdu);

        let timer = OperationTimer::start(request.function().name());
        let result = {
            let txn = inner.pending.insert(Transaction::new(id, self.unit_id, request, timeout));
            match exchange(&mut inner.transport, txn, pdu).await {
                Ok((response, raw)) => {
                    inner.logger.log_response(self.unit_id, id, &response, &raw);
                    txn.complete(response);
                },
                Err(error) => txn.fail(error),
            }
            txn.outcome()
        };
        inner.pending = None;
        let duration = timer.stop();

        match result {
            Ok(response) => {
                inner.metrics.record_success(duration);
                Ok(response)
            },
            Err(error) => {
                inner.metrics.record_failure(duration, &error);
                if !matches!(error, ModbusError::Exception { .. }) {
                    inner.logger.log_failure(self.unit_id, id, &error);
                }

                match error {
                    ModbusError::Transport { .. } | ModbusError::ConnectionLost { .. } => {
                        Err(inner.lose_transport(error).await)
                    },
                    ModbusError::Timeout { .. } if self.kind == TransportKind::Rtu => {
                        inner.owed_until = Some(Instant::now() + self.late_response_window());
                        Err(error)
                    },
                    ModbusError::Timeout { .. }
                    | ModbusError::MalformedFrame { .. }
                    | ModbusError::CrcMismatch { .. } => {
                        inner.stale_input = true;
                        Err(error)
                    },
                    other => Err(other),
                }
            },
        }
    }

    /// Re-establish the transport after a failure or `close`
    pub async fn reconnect(&self) -> ModbusResult<()> {
        let mut inner = self.lock_idle().await?;
        inner.pending = None;
        inner.stale_input = false;
        inner.owed_until = None;
        let result = inner.transport.reconnect().await;
        self.connected.store(inner.transport.is_connected(), Ordering::Release);
        result
    }

    /// Close the transport; the connection becomes `Disconnected`
    pub async fn close(&self) -> ModbusResult<()> {
        let mut inner = self.lock_idle().await?;
        inner.pending = None;
        debug!("Closing connection\n{}", format::format_metrics(&inner.metrics));
        let result = inner.transport.close().await;
        self.connected.store(false, Ordering::Release);
        result
    }

    /// Lock for a lifecycle change; fails while a transaction is in flight
    async fn lock_idle(&self) -> ModbusResult<MutexGuard<'_, ConnectionInner<T>>> {
        if self.busy.load(Ordering::Acquire) {
            return Err(ModbusError::busy(self.in_flight.load(Ordering::Acquire)));
        }
        Ok(self.inner.lock().await)
    }

    /// Transaction metrics collected so far
    pub async fn metrics(&self) -> PerformanceMetrics {
        self.inner.lock().await.metrics.clone()
    }

    /// Transport-level statistics
    pub async fn transport_stats(&self) -> TransportStats {
        self.inner.lock().await.transport.get_stats()
    }

    /// Id the next transaction will be sent under
    pub async fn next_transaction_id(&self) -> u16 {
        self.inner.lock().await.ids.peek()
    }

    /// Give back the transport
    pub fn into_transport(self) -> T {
        self.inner.into_inner().transport
    }
}

/// Send one transaction and wait for the frame that answers it
///
/// Frames belonging to earlier transactions are skipped while time remains.
async fn exchange<T: ModbusTransport>(
    transport: &mut T,
    txn: &Transaction,
    pdu: Vec<u8>,
) -> ModbusResult<(ModbusResponse, Vec<u8>)> {
    let adu = txn.to_adu(transport.kind(), pdu);
    transport.send(&adu).await?;

    loop {
        let remaining = txn.remaining();
        if remaining.is_zero() {
            return Err(txn.timeout_error());
        }

        let frame = match transport.receive(remaining).await {
            Err(ModbusError::Timeout { .. }) => return Err(txn.timeout_error()),
            other => other?,
        };

        match txn.correlate(&frame)? {
            Correlation::Matched => {
                let response = codec::decode_response(txn.request(), &frame.pdu)?;
                return Ok((response, frame.pdu));
            },
            Correlation::Stale { transaction_id } => {
                warn!(
                    "Discarding stale response for transaction {} while awaiting {}",
                    transaction_id, txn.id()
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{encode_mbap_frame, Adu};
    use tokio_test::io::Builder;

    fn mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        encode_mbap_frame(&Adu { transaction_id: Some(transaction_id), unit_id, pdu: pdu.to_vec() }).unwrap()
    }

    const READ_3: [u8; 5] = [0x03, 0x00, 0x00, 0x00, 0x03];
    const VALUES_3: [u8; 8] = [0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E];

    fn read_three() -> ModbusRequest {
        ModbusRequest::ReadHoldingRegisters { address: 0, quantity: 3 }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let mock = Builder::new()
            .write(&mbap(1, 1, &READ_3))
            .read(&mbap(1, 1, &VALUES_3))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        let response = connection.dispatch(read_three()).await.unwrap();
        assert_eq!(response, ModbusResponse::ReadHoldingRegisters(vec![10, 20, 30]));
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(connection.next_transaction_id().await, 2);

        let metrics = connection.metrics().await;
        assert_eq!(metrics.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_stale_response_is_skipped() {
        let mock = Builder::new()
            .write(&mbap(1, 1, &READ_3))
            .read(&mbap(99, 1, &[0x06, 0x00, 0x01, 0x00, 0x03]))
            .read(&mbap(1, 1, &VALUES_3))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        let response = connection.dispatch(read_three()).await.unwrap();
        assert_eq!(response, ModbusResponse::ReadHoldingRegisters(vec![10, 20, 30]));
    }

    #[tokio::test]
    async fn test_exception_response() {
        let mock = Builder::new()
            .write(&mbap(1, 1, &READ_3))
            .read(&mbap(1, 1, &[0x83, 0x02]))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        let result = connection.dispatch(read_three()).await;
        assert_eq!(result, Err(ModbusError::exception(0x03, 0x02)));
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(connection.metrics().await.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_unit_id_mismatch() {
        let mock = Builder::new()
            .write(&mbap(1, 5, &READ_3))
            .read(&mbap(1, 6, &VALUES_3))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock)).with_unit_id(5);

        let result = connection.dispatch(read_three()).await;
        assert!(matches!(result, Err(ModbusError::MalformedFrame { .. })));
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_transaction_id_wraps() {
        let mock = Builder::new()
            .write(&mbap(65535, 1, &READ_3))
            .read(&mbap(65535, 1, &VALUES_3))
            .write(&mbap(0, 1, &READ_3))
            .read(&mbap(0, 1, &VALUES_3))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock))
            .with_transaction_ids(TransactionIdCounter::starting_at(65535));

        assert!(connection.dispatch(read_three()).await.is_ok());
        assert!(connection.dispatch(read_three()).await.is_ok());
    }

    #[tokio::test]
    async fn test_eof_disconnects() {
        let mock = Builder::new().write(&mbap(1, 1, &READ_3)).build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        let result = connection.dispatch(read_three()).await;
        assert!(matches!(result, Err(ModbusError::ConnectionLost { .. })));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // No I/O happens on a disconnected connection
        let result = connection.dispatch(read_three()).await;
        assert!(matches!(result, Err(ModbusError::ConnectionLost { .. })));
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_the_wire() {
        let mock = Builder::new().build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        let result = connection.dispatch(ModbusRequest::ReadCoils { address: 0, quantity: 2001 }).await;
        assert!(matches!(result, Err(ModbusError::InvalidArgument { .. })));

        let result = connection.dispatch_with_timeout(read_three(), Duration::ZERO).await;
        assert!(matches!(result, Err(ModbusError::InvalidArgument { .. })));

        assert_eq!(connection.transport_stats().await.requests_sent, 0);
        assert_eq!(connection.next_transaction_id().await, 1);
    }

    #[tokio::test]
    async fn test_unit_id_outside_range_never_reaches_the_wire() {
        let write = ModbusRequest::WriteSingleRegister { address: 5, value: 42 };

        for unit_id in [0u8, 248] {
            let connection = Connection::new(TcpTransport::from_stream(Builder::new().build()))
                .with_unit_id(unit_id);
            let result = connection.dispatch(write.clone()).await;
            assert!(matches!(result, Err(ModbusError::InvalidArgument { .. })));
            assert_eq!(connection.transport_stats().await.requests_sent, 0);
        }
    }

    #[tokio::test]
    async fn test_stats_reader_does_not_make_dispatch_busy() {
        let mock = Builder::new()
            .write(&mbap(1, 1, &READ_3))
            .read(&mbap(1, 1, &VALUES_3))
            .build();
        let connection = Connection::new(TcpTransport::from_stream(mock));

        // Held the way `metrics` or `transport_stats` hold it
        let reader = connection.inner.lock().await;
        assert_eq!(connection.state(), ConnectionState::Idle);

        let (response, ()) = tokio::join!(connection.dispatch(read_three()), async {
            tokio::task::yield_now().await;
            assert_eq!(connection.state(), ConnectionState::AwaitingResponse);
            drop(reader);
        });

        assert_eq!(response.unwrap(), ModbusResponse::ReadHoldingRegisters(vec![10, 20, 30]));
        assert_eq!(connection.state(), ConnectionState::Idle);
    }
}
