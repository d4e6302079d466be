//! # Adapter Configuration

use crate::command::SG_CAPACITY;
use crate::waiter::ADMIN_ARENA_CAPACITY;
use crate::{HbaError, HbaResult};
use static_assertions::const_assert;

// The hardware command id is eight bits wide.
const_assert!(HbaConfig::MAX_POOL_SIZE <= 256);
const_assert!(HbaConfig::DEFAULT_MAX_SG_ENTRIES <= SG_CAPACITY);
const_assert!(HbaConfig::DEFAULT_ADMIN_QUEUE_DEPTH <= ADMIN_ARENA_CAPACITY);
const_assert!(HbaConfig::DEFAULT_MAX_TRANSFER % HbaConfig::DEFAULT_BLOCK_SIZE == 0);

/// How a blocked administrative submitter waits for its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Spin until the completion engine, running in interrupt context on
    /// another CPU, raises the waiter
    Interrupt,
    /// Drive the completion engine from the waiting context, at most
    /// `budget` times
    Polled {
        /// Number of completion polls before giving up
        budget: u32,
    },
}

/// Configuration for one adapter
#[derive(Debug, Clone)]
pub struct HbaConfig {
    /// Hardware slots, including the reserved internal slot
    pub pool_size: usize,
    /// Logical block size in bytes
    pub block_size: u32,
    /// Largest transfer a single hardware command may carry (bytes)
    pub max_transfer: u32,
    /// Scatter/gather entries per hardware command
    pub max_sg_entries: usize,
    /// Administrative commands allowed in flight at once
    pub admin_concurrency: usize,
    /// Blocked administrative submitters allowed at once
    pub admin_queue_depth: usize,
    /// Doorbell polls before the issuer reports busy
    pub issue_poll_limit: u32,
    /// Consecutive busy issues tolerated for one request
    pub issue_retry_limit: u32,
    /// Status ring entries
    pub ring_capacity: u32,
    /// Completion polls for an internal command
    pub internal_poll_budget: u32,
    /// Logical drives tracked in the drive table
    pub max_logical_drives: usize,
    /// Physical channels
    pub max_buses: u8,
    /// Targets per physical channel
    pub targets_per_bus: u8,
    /// Administrative wait strategy
    pub admin_wait: WaitMode,
    /// Vendor identification reported for logical drives
    pub vendor_id: [u8; 8],
    /// Product identification reported for logical drives
    pub product_id: [u8; 16],
}

impl HbaConfig {
    /// Default slot count
    pub const DEFAULT_POOL_SIZE: usize = 32;
    /// Largest slot count the 8-bit command id can address
    pub const MAX_POOL_SIZE: usize = 255;
    /// Default block size
    pub const DEFAULT_BLOCK_SIZE: u32 = 512;
    /// Default per-command transfer limit: 128 KiB
    pub const DEFAULT_MAX_TRANSFER: u32 = 128 * 1024;
    /// Default scatter/gather entries per command
    pub const DEFAULT_MAX_SG_ENTRIES: usize = 17;
    /// Default administrative concurrency
    pub const DEFAULT_ADMIN_CONCURRENCY: usize = 1;
    /// Default administrative waiter count
    pub const DEFAULT_ADMIN_QUEUE_DEPTH: usize = 8;
    /// Default doorbell poll budget
    pub const DEFAULT_ISSUE_POLL_LIMIT: u32 = 1000;
    /// Default busy retries per request
    pub const DEFAULT_ISSUE_RETRY_LIMIT: u32 = 64;
    /// Default internal command poll budget
    pub const DEFAULT_INTERNAL_POLL_BUDGET: u32 = 100_000;
    /// Targets addressable per channel
    pub const MAX_TARGETS_PER_BUS: u8 = 16;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            pool_size: Self::DEFAULT_POOL_SIZE,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_transfer: Self::DEFAULT_MAX_TRANSFER,
            max_sg_entries: Self::DEFAULT_MAX_SG_ENTRIES,
            admin_concurrency: Self::DEFAULT_ADMIN_CONCURRENCY,
            admin_queue_depth: Self::DEFAULT_ADMIN_QUEUE_DEPTH,
            issue_poll_limit: Self::DEFAULT_ISSUE_POLL_LIMIT,
            issue_retry_limit: Self::DEFAULT_ISSUE_RETRY_LIMIT,
            ring_capacity: Self::DEFAULT_POOL_SIZE as u32 + 1,
            internal_poll_budget: Self::DEFAULT_INTERNAL_POLL_BUDGET,
            max_logical_drives: 8,
            max_buses: 4,
            targets_per_bus: Self::MAX_TARGETS_PER_BUS,
            admin_wait: WaitMode::Interrupt,
            vendor_id: *b"HELIX   ",
            product_id: *b"RAID LOGICAL VOL",
        }
    }

    /// Create a small configuration (bring-up, constrained controllers)
    pub fn minimal() -> Self {
        Self {
            pool_size: 4,
            ring_capacity: 5,
            max_logical_drives: 2,
            max_buses: 1,
            ..Self::new()
        }
    }

    /// Create a configuration for controllers that accept 1 MiB commands
    pub fn large_transfer() -> Self {
        Self {
            max_transfer: 1024 * 1024,
            max_sg_entries: SG_CAPACITY,
            ..Self::new()
        }
    }

    /// Set the slot count; the status ring follows it
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self.ring_capacity = pool_size as u32 + 1;
        self
    }

    /// Set the per-command transfer limit
    pub fn with_max_transfer(mut self, max_transfer: u32) -> Self {
        self.max_transfer = max_transfer;
        self
    }

    /// Set the scatter/gather limit
    pub fn with_max_sg_entries(mut self, entries: usize) -> Self {
        self.max_sg_entries = entries;
        self
    }

    /// Set the administrative wait strategy
    pub fn with_admin_wait(mut self, wait: WaitMode) -> Self {
        self.admin_wait = wait;
        self
    }

    /// Set the doorbell poll budget and busy retry limit
    pub fn with_issue_limits(mut self, polls: u32, retries: u32) -> Self {
        self.issue_poll_limit = polls;
        self.issue_retry_limit = retries;
        self
    }

    /// Set the internal command poll budget
    pub fn with_internal_poll_budget(mut self, budget: u32) -> Self {
        self.internal_poll_budget = budget;
        self
    }

    /// Slots visible to callers (one is reserved)
    pub fn caller_slots(&self) -> usize {
        self.pool_size.saturating_sub(1)
    }

    /// Check the configuration against hardware limits
    pub fn validate(&self) -> HbaResult<()> {
        if self.pool_size < 2 || self.pool_size > Self::MAX_POOL_SIZE {
            return Err(HbaError::InvalidConfig("pool_size must be within 2..=255"));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(HbaError::InvalidConfig("block_size must be a power of two"));
        }
        if self.max_transfer == 0 || self.max_transfer % self.block_size != 0 {
            return Err(HbaError::InvalidConfig("max_transfer must be a non-zero multiple of block_size"));
        }
        if self.max_sg_entries == 0 || self.max_sg_entries > SG_CAPACITY {
            return Err(HbaError::InvalidConfig("max_sg_entries exceeds scatter/gather capacity"));
        }
        if self.admin_concurrency == 0 || self.admin_concurrency >= self.pool_size {
            return Err(HbaError::InvalidConfig("admin_concurrency must leave slots for I/O"));
        }
        if self.admin_queue_depth == 0 || self.admin_queue_depth > ADMIN_ARENA_CAPACITY {
            return Err(HbaError::InvalidConfig("admin_queue_depth exceeds waiter arena"));
        }
        if self.issue_poll_limit == 0 {
            return Err(HbaError::InvalidConfig("issue_poll_limit must be non-zero"));
        }
        if (self.ring_capacity as usize) < self.pool_size {
            return Err(HbaError::InvalidConfig("ring_capacity smaller than pool"));
        }
        if self.max_logical_drives == 0 || self.max_logical_drives > 256 {
            return Err(HbaError::InvalidConfig("max_logical_drives must be within 1..=256"));
        }
        if self.targets_per_bus == 0 || self.targets_per_bus > Self::MAX_TARGETS_PER_BUS {
            return Err(HbaError::InvalidConfig("targets_per_bus must be within 1..=16"));
        }
        Ok(())
    }
}

impl Default for HbaConfig {
    fn default() -> Self {
        Self::new()
    }
}
