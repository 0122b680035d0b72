//! # Transactions
//!
//! A transaction is one request on the wire: the id it was sent under, the
//! request itself, a deadline and how it resolved. [`crate::connection`]
//! owns at most one of them at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! dispatch ─► Pending ─┬─► Completed(response)   matching frame decoded
//!                      └─► Failed(error)         timeout, transport or decode failure
//! ```

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{Adu, TransportKind};

/// Transaction id source for one connection
///
/// Ids start at 1, increase by one per transaction and wrap from 65535 to 0.
#[derive(Debug, Clone)]
pub struct TransactionIdCounter {
    next: u16,
}

impl TransactionIdCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose next id is `first`
    pub fn starting_at(first: u16) -> Self {
        Self { next: first }
    }

    /// Allocate the next id
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Id the next allocation will return
    pub fn peek(&self) -> u16 {
        self.next
    }
}

impl Default for TransactionIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution state of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Completed(ModbusResponse),
    Failed(ModbusError),
}

/// How an inbound frame relates to the pending transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The frame answers this transaction
    Matched,
    /// The frame answers an earlier, abandoned transaction
    Stale { transaction_id: u16 },
}

/// One in-flight request
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u16,
    unit_id: SlaveId,
    request: ModbusRequest,
    started_at: Instant,
    timeout: Duration,
    state: TransactionState,
}

impl Transaction {
    /// Create a pending transaction whose deadline is `timeout` from now
    pub fn new(id: u16, unit_id: SlaveId, request: ModbusRequest, timeout: Duration) -> Self {
        Self {
            id,
            unit_id,
            request,
            started_at: Instant::now(),
            timeout,
            state: TransactionState::Pending,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }

    pub fn request(&self) -> &ModbusRequest {
        &self.request
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == TransactionState::Pending
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The timeout error this transaction fails with at its deadline
    pub fn timeout_error(&self) -> ModbusError {
        ModbusError::timeout(
            format!("{} (transaction {})", self.request.function().name(), self.id),
            self.timeout.as_millis() as u64,
        )
    }

    /// Frame this transaction is sent as
    pub fn to_adu(&self, kind: TransportKind, pdu: Vec<u8>) -> Adu {
        Adu {
            transaction_id: match kind {
                TransportKind::Tcp => Some(self.id),
                TransportKind::Rtu => None,
            },
            unit_id: self.unit_id,
            pdu,
        }
    }

    /// Decide whether `frame` answers this transaction
    ///
    /// On TCP a different transaction id marks a stale frame. Serial lines
    /// carry no id, so every frame is taken as the answer. A frame from
    /// another unit fails with `MalformedFrame`.
    pub fn correlate(&self, frame: &Adu) -> ModbusResult<Correlation> {
        if let Some(transaction_id) = frame.transaction_id {
            if transaction_id != self.id {
                return Ok(Correlation::Stale { transaction_id });
            }
        }

        if frame.unit_id != self.unit_id {
            return Err(ModbusError::malformed(format!(
                "Response unit id {} does not match request unit id {}",
                frame.unit_id, self.unit_id
            )));
        }

        Ok(Correlation::Matched)
    }

    /// Resolve with a decoded response
    pub fn complete(&mut self, response: ModbusResponse) {
        self.state = TransactionState::Completed(response);
    }

    /// Resolve with an error
    pub fn fail(&mut self, error: ModbusError) {
        self.state = TransactionState::Failed(error);
    }

    /// Outcome for the caller; exception responses become `Exception` errors
    pub fn outcome(&self) -> ModbusResult<ModbusResponse> {
        match &self.state {
            TransactionState::Completed(response) => response.clone().into_result(),
            TransactionState::Failed(error) => Err(error.clone()),
            TransactionState::Pending => Err(ModbusError::transport(format!(
                "Transaction {} was never resolved", self.id
            ))),
        }
    }
}
