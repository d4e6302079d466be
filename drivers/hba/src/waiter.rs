//! # Administrative Waiters
//!
//! Fixed arena of wait cells for blocked `submit_admin` callers. A cell is
//! claimed by the submitter, raised by the completion engine and read back by
//! the submitter without taking the adapter lock.
//!
//! ```text
//!          claim()           signal()            take()
//! FREE ─────────────► PENDING ──────────► DONE ──────────► FREE
//!                        │
//!                        │ abandon()          signal()
//!                        └──────────► ABANDONED ──────────► FREE
//! ```

use crate::request::Outcome;
use core::sync::atomic::{AtomicU8, Ordering};
use heapless::Vec as FixedVec;

/// Upper bound on administrative waiters
pub const ADMIN_ARENA_CAPACITY: usize = 8;

const FREE: u8 = 0x00;
const PENDING: u8 = 0x01;
const ABANDONED: u8 = 0x02;
const DONE: u8 = 0x80;

fn encode(outcome: Outcome) -> u8 {
    DONE | match outcome {
        Outcome::Success => 0,
        Outcome::RecoveredIgnore => 1,
        Outcome::RetryableTimeout => 2,
        Outcome::DeviceReset => 3,
        Outcome::FatalError => 4,
        Outcome::Cancelled => 5,
    }
}

fn decode(state: u8) -> Option<Outcome> {
    if state & DONE == 0 {
        return None;
    }
    Some(match state & !DONE {
        0 => Outcome::Success,
        1 => Outcome::RecoveredIgnore,
        2 => Outcome::RetryableTimeout,
        3 => Outcome::DeviceReset,
        4 => Outcome::FatalError,
        _ => Outcome::Cancelled,
    })
}

/// Arena of administrative wait cells
#[derive(Debug)]
pub(crate) struct AdminWaiters {
    cells: FixedVec<AtomicU8, ADMIN_ARENA_CAPACITY>,
}

impl AdminWaiters {
    /// Create `depth` cells, capped at the arena capacity
    pub fn new(depth: usize) -> Self {
        let mut cells = FixedVec::new();
        for _ in 0..depth.min(ADMIN_ARENA_CAPACITY) {
            if cells.push(AtomicU8::new(FREE)).is_err() {
                break;
            }
        }
        Self { cells }
    }

    /// Claim a free cell
    pub fn claim(&self) -> Option<usize> {
        self.cells.iter().position(|cell| {
            cell.compare_exchange(FREE, PENDING, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Raise a cell. An abandoned cell is reclaimed instead.
    pub fn signal(&self, index: usize, outcome: Outcome) {
        let Some(cell) = self.cells.get(index) else {
            return;
        };
        match cell.compare_exchange(PENDING, encode(outcome), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(ABANDONED) => cell.store(FREE, Ordering::Release),
            Err(state) => log::warn!("[hba] admin waiter {} signalled in state {:#04x}", index, state),
        }
    }

    /// Read a raised cell and free it
    pub fn take(&self, index: usize) -> Option<Outcome> {
        let cell = self.cells.get(index)?;
        let state = cell.load(Ordering::Acquire);
        let outcome = decode(state)?;
        cell.store(FREE, Ordering::Release);
        Some(outcome)
    }

    /// Give up waiting. If the cell was raised in the meantime its outcome
    /// is returned and the cell freed.
    pub fn abandon(&self, index: usize) -> Option<Outcome> {
        let cell = self.cells.get(index)?;
        match cell.compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => None,
            Err(_) => self.take(index),
        }
    }

    /// Release a cell whose request never reached the queue
    pub fn release(&self, index: usize) {
        if let Some(cell) = self.cells.get(index) {
            cell.store(FREE, Ordering::Release);
        }
    }

    /// Cells not free
    pub fn in_use(&self) -> usize {
        self.cells.iter().filter(|c| c.load(Ordering::Relaxed) != FREE).count()
    }
}
