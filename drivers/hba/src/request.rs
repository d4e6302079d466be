//! # Caller Requests and Outcomes
//!
//! A [`ScsiRequest`] is owned by the core from `submit` until its completion
//! sink runs. The sink is consumed when it is invoked, so a request can be
//! completed at most once.

use crate::command::{AdminOpcode, IoDirection};
use crate::hal::DmaSegment;
use crate::scsi::Cdb;
use crate::{RequestId, TargetAddr};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

// =============================================================================
// Outcome
// =============================================================================

/// Result of a caller request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Completed normally
    Success,
    /// Controller recovered an error; treated as success
    RecoveredIgnore,
    /// Retryable: selection timeout, hidden device, busy controller
    RetryableTimeout,
    /// Retryable: the adapter or device was reset under the request
    DeviceReset,
    /// Not retryable
    FatalError,
    /// Removed by abort before reaching hardware
    Cancelled,
}

impl Outcome {
    /// The outcome a caller is shown
    pub const fn caller_visible(self) -> Self {
        match self {
            Self::RecoveredIgnore => Self::Success,
            other => other,
        }
    }

    /// Did the command complete?
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::RecoveredIgnore)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::RecoveredIgnore => "recovered",
            Self::RetryableTimeout => "retryable timeout",
            Self::DeviceReset => "device reset",
            Self::FatalError => "fatal error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Completion
// =============================================================================

/// What a caller receives through its completion sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Request being completed
    pub request: RequestId,
    /// Result
    pub outcome: Outcome,
    /// Bytes moved by successfully completed hardware commands
    ///
    /// When `underrun` is set the device reported a short transfer and this
    /// is the requested length, an upper bound on what actually moved.
    pub transferred: u64,
    /// The device moved less data than requested
    pub underrun: bool,
    /// Sense data, for passthrough errors and local check conditions
    pub sense: Option<Vec<u8>>,
    /// Locally synthesised reply data
    pub reply: Option<Vec<u8>>,
}

impl Completion {
    /// Completion with no data
    pub fn new(request: RequestId, outcome: Outcome) -> Self {
        Self {
            request,
            outcome: outcome.caller_visible(),
            transferred: 0,
            underrun: false,
            sense: None,
            reply: None,
        }
    }

    /// Set the transferred byte count
    pub fn with_transferred(mut self, bytes: u64) -> Self {
        self.transferred = bytes;
        self
    }

    /// Mark the transfer as short
    pub fn with_underrun(mut self, underrun: bool) -> Self {
        self.underrun = underrun;
        self
    }

    /// Attach sense data
    pub fn with_sense(mut self, sense: Option<Vec<u8>>) -> Self {
        self.sense = sense;
        self
    }

    /// Attach reply data
    pub fn with_reply(mut self, reply: Vec<u8>) -> Self {
        self.reply = Some(reply);
        self
    }
}

/// Caller completion callback
pub type CompletionSink = Box<dyn FnOnce(Completion) + Send>;

// =============================================================================
// SCSI Request
// =============================================================================

/// A SCSI command from the OS storage stack
pub struct ScsiRequest {
    /// Caller identity, used by abort
    pub id: RequestId,
    /// Addressed device
    pub target: TargetAddr,
    /// Command
    pub cdb: Cdb,
    /// DMA-mapped data buffer
    pub data: Vec<DmaSegment>,
    /// Requested timeout in seconds
    pub timeout_secs: u32,
    sink: CompletionSink,
}

impl ScsiRequest {
    /// Default timeout
    pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

    /// Create a request with no data phase
    pub fn new<F>(id: RequestId, target: TargetAddr, cdb: Cdb, sink: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            id,
            target,
            cdb,
            data: Vec::new(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            sink: Box::new(sink),
        }
    }

    /// Attach the data buffer
    pub fn with_data(mut self, data: Vec<DmaSegment>) -> Self {
        self.data = data;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Total bytes in the data buffer
    pub fn data_len(&self) -> u64 {
        self.data.iter().map(|s| s.len as u64).sum()
    }

    /// Hand the completion to the caller
    pub(crate) fn complete(self, completion: Completion) {
        (self.sink)(completion)
    }
}

impl fmt::Debug for ScsiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiRequest")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("opcode", &self.cdb.opcode())
            .field("segments", &self.data.len())
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// =============================================================================
// Administrative Request
// =============================================================================

/// A controller management command submitted synchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRequest {
    /// Caller identity, used by abort
    pub id: RequestId,
    /// Operation
    pub opcode: AdminOpcode,
    /// Opcode specific parameter word
    pub param: u32,
    /// Optional DMA-mapped buffer
    pub buffer: Option<DmaSegment>,
}

impl AdminRequest {
    /// Create a request with no buffer
    pub fn new(id: RequestId, opcode: AdminOpcode) -> Self {
        Self { id, opcode, param: 0, buffer: None }
    }

    /// Set the parameter word
    pub fn with_param(mut self, param: u32) -> Self {
        self.param = param;
        self
    }

    /// Attach a buffer
    pub fn with_buffer(mut self, buffer: DmaSegment) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

// =============================================================================
// Queued Work
// =============================================================================

/// Logical drive transfer resolved from the CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IoPlan {
    pub direction: IoDirection,
    pub drive: u8,
    pub start_lba: u64,
}

/// A SCSI request queued or in flight
///
/// `cursor` is the number of bytes handed to hardware so far. It only grows
/// and never passes `total`.
#[derive(Debug)]
pub(crate) struct PendingScsi {
    pub request: ScsiRequest,
    pub total: u64,
    pub cursor: u64,
    pub busy_retries: u32,
    pub io: Option<IoPlan>,
}

impl PendingScsi {
    pub fn new(request: ScsiRequest) -> Self {
        let total = request.data_len();
        Self { request, total, cursor: 0, busy_retries: 0, io: None }
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.cursor
    }

    pub fn advance(&mut self, bytes: u64) {
        debug_assert!(self.cursor + bytes <= self.total);
        self.cursor = (self.cursor + bytes).min(self.total);
    }
}

/// An administrative request queued or in flight
#[derive(Debug)]
pub(crate) struct PendingAdmin {
    pub request: AdminRequest,
    pub waiter: usize,
    pub busy_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_recovered_is_success_to_caller() {
        assert_eq!(Outcome::RecoveredIgnore.caller_visible(), Outcome::Success);
        assert_eq!(Outcome::DeviceReset.caller_visible(), Outcome::DeviceReset);
        let c = Completion::new(RequestId::new(1), Outcome::RecoveredIgnore);
        assert_eq!(c.outcome, Outcome::Success);
    }

    #[test]
    fn test_sink_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let cdb = Cdb::new(&[0x00, 0, 0, 0, 0, 0]).unwrap();
        let request = ScsiRequest::new(RequestId::new(7), TargetAddr::logical(0), cdb, move |c| {
            assert_eq!(c.request, RequestId::new(7));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        request.complete(Completion::new(RequestId::new(7), Outcome::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_cursor() {
        let cdb = Cdb::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0]).unwrap();
        let request = ScsiRequest::new(RequestId::new(1), TargetAddr::logical(0), cdb, |_| {})
            .with_data(alloc::vec![DmaSegment::new(0x1000, 2048), DmaSegment::new(0x4000, 2048)]);
        let mut pending = PendingScsi::new(request);
        assert_eq!(pending.total, 4096);
        pending.advance(1024);
        assert_eq!(pending.remaining(), 3072);
    }
}
