//! End-to-end adapter scenarios against the scripted controller.

use crate::command::{AdminOpcode, NativeCommand};
use crate::config::{HbaConfig, WaitMode};
use crate::drives::LogicalDrive;
use crate::hal::{DmaSegment, PhysAddr};
use crate::mock::MockController;
use crate::request::{AdminRequest, Completion, Outcome, ScsiRequest};
use crate::scsi::{opcode, Cdb};
use crate::status::{basic, extended};
use crate::{AdapterContext, AdapterFlags, HbaError, HbaResult, RequestId, SlotId, TargetAddr};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;
use spin::Mutex;
use std::thread::{self, JoinHandle};

const KIB: u32 = 1024;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    adapter: Arc<AdapterContext<MockController>>,
    log: Arc<Mutex<Vec<Completion>>>,
    posted: Cell<usize>,
}

impl Harness {
    fn new(config: HbaConfig) -> Self {
        let adapter = AdapterContext::attach(config, MockController::new(), PhysAddr::new(0x10_0000)).unwrap();
        adapter.set_logical_drive(0, LogicalDrive::online(1 << 24, 5)).unwrap();
        Self {
            adapter: Arc::new(adapter),
            log: Arc::new(Mutex::new(Vec::new())),
            posted: Cell::new(0),
        }
    }

    fn request(&self, id: u64, target: TargetAddr, cdb: Cdb) -> ScsiRequest {
        let log = self.log.clone();
        ScsiRequest::new(RequestId::new(id), target, cdb, move |c| log.lock().push(c))
    }

    fn read(&self, id: u64, lba: u32, data: Vec<DmaSegment>) {
        let bytes: u32 = data.iter().map(|s| s.len).sum();
        let cdb = read10(lba, (bytes / 512) as u16);
        self.adapter.submit(self.request(id, TargetAddr::logical(0), cdb).with_data(data));
    }

    fn started(&self) -> Vec<NativeCommand> {
        self.adapter.with_hardware(|hw| hw.started.iter().map(|(_, c)| c.clone()).collect())
    }

    fn started_count(&self) -> usize {
        self.adapter.with_hardware(|hw| hw.started.len())
    }

    /// Forget commands started so far; they will not be auto-completed
    fn mark_posted(&self) {
        self.posted.set(self.started_count());
    }

    /// Complete the `index`th started command
    fn complete(&self, index: usize, basic: u8, extended: u8) {
        let slot = self.started()[index].command_id();
        self.adapter.with_hardware(|hw| hw.post(slot, basic, extended));
        self.adapter.on_interrupt();
    }

    /// Complete every started command successfully until the adapter is idle
    fn run_to_idle(&self) {
        for _ in 0..1000 {
            let slots: Vec<SlotId> = self.adapter.with_hardware(|hw| hw.started_slots());
            let from = self.posted.get();
            self.adapter.with_hardware(|hw| {
                for &slot in &slots[from..] {
                    hw.post_success(slot);
                }
            });
            self.posted.set(slots.len());
            self.adapter.on_interrupt();

            let depths = self.adapter.queue_depths();
            if depths.active == 0 && depths.waiting == 0 && depths.admin_waiting == 0 {
                return;
            }
        }
        panic!("adapter never went idle");
    }

    fn completions(&self) -> Vec<Completion> {
        self.log.lock().clone()
    }

    fn outcome_of(&self, id: u64) -> Vec<Outcome> {
        self.log
            .lock()
            .iter()
            .filter(|c| c.request == RequestId::new(id))
            .map(|c| c.outcome)
            .collect()
    }
}

/// Every caller slot is either free or on the active queue
fn assert_slots_conserved(h: &Harness) {
    let depths = h.adapter.queue_depths();
    assert_eq!(depths.free + depths.active, h.adapter.config().caller_slots());
}

/// Submit a blocking administrative request from another context
fn spawn_admin(h: &Harness, id: u64) -> JoinHandle<HbaResult<Outcome>> {
    let adapter = h.adapter.clone();
    thread::spawn(move || adapter.submit_admin(AdminRequest::new(RequestId::new(id), AdminOpcode::Enquiry)))
}

fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        thread::yield_now();
    }
}

fn read10(lba: u32, blocks: u16) -> Cdb {
    let l = lba.to_be_bytes();
    let b = blocks.to_be_bytes();
    Cdb::new(&[opcode::READ_10, 0, l[0], l[1], l[2], l[3], 0, b[0], b[1], 0]).unwrap()
}

fn contiguous(addr: u64, len: u32) -> Vec<DmaSegment> {
    vec![DmaSegment::new(addr, len)]
}

fn io_of(cmd: &NativeCommand) -> (u64, u32, u32) {
    match cmd {
        NativeCommand::Io(io) => (io.lba, io.sectors, io.transfer.len()),
        other => panic!("expected I/O command, got {:?}", other),
    }
}

// =============================================================================
// Breakup
// =============================================================================

#[test]
fn test_256k_read_splits_into_two_ordered_chunks() {
    let h = Harness::new(HbaConfig::default());
    h.read(1, 0, contiguous(0x4000_0000, 256 * KIB));

    // Only the first chunk is on hardware
    assert_eq!(h.started_count(), 1);
    assert_eq!(io_of(&h.started()[0]), (0, 256, 128 * KIB));

    h.complete(0, basic::SUCCESS, 0);
    assert!(h.completions().is_empty());
    assert_eq!(h.started_count(), 2);
    assert_eq!(io_of(&h.started()[1]), (256, 256, 128 * KIB));

    h.complete(1, basic::SUCCESS, 0);
    let done = h.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Success);
    assert_eq!(done[0].transferred, 256 * KIB as u64);

    let stats = h.adapter.stats();
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_chunk_count_matches_transfer_size() {
    let max = HbaConfig::DEFAULT_MAX_TRANSFER;
    for (n, len) in [512, max, max + 512, 3 * max, 8 * max - 512].into_iter().enumerate() {
        let h = Harness::new(HbaConfig::default());
        h.read(n as u64, 100, contiguous(0x4000_0000, len));
        h.run_to_idle();

        let started = h.started();
        assert_eq!(started.len() as u32, (len + max - 1) / max);

        let mut expected_lba = 100;
        let mut sum = 0;
        for cmd in &started {
            let (lba, sectors, bytes) = io_of(cmd);
            assert_eq!(lba, expected_lba);
            expected_lba += sectors as u64;
            sum += bytes;
        }
        assert_eq!(sum, len);
        assert_eq!(h.completions()[0].transferred, len as u64);
    }
}

#[test]
fn test_scatter_limit_shortens_chunks() {
    let h = Harness::new(HbaConfig::default());
    let data: Vec<DmaSegment> = (0..40u64).map(|i| DmaSegment::new(0x4000_0000 + i * 0x10_000, 4 * KIB)).collect();
    h.read(1, 0, data);
    h.run_to_idle();

    let lens: Vec<u32> = h.started().iter().map(|c| io_of(c).2).collect();
    assert_eq!(lens, [68 * KIB, 68 * KIB, 24 * KIB]);
    assert_eq!(h.completions()[0].transferred, 160 * KIB as u64);
}

#[test]
fn test_breakup_stops_on_error() {
    let h = Harness::new(HbaConfig::default());
    h.read(1, 0, contiguous(0x4000_0000, 384 * KIB));

    h.complete(0, basic::SUCCESS, 0);
    h.complete(1, basic::LD_ERROR, 0);

    assert_eq!(h.started_count(), 2);
    let done = h.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::FatalError);
    assert_eq!(done[0].transferred, 128 * KIB as u64);
    assert_eq!(h.adapter.queue_depths().active, 0);
}

// =============================================================================
// Back-pressure
// =============================================================================

#[test]
fn test_twice_pool_size_requests_all_complete_once() {
    let config = HbaConfig::new().with_pool_size(8);
    let h = Harness::new(config);

    for id in 0..16 {
        h.read(id, id as u32 * 8, contiguous(0x4000_0000 + id * 0x1_0000, 4 * KIB));
    }

    assert_eq!(h.started_count(), 7);
    let depths = h.adapter.queue_depths();
    assert_eq!(depths.active, 7);
    assert_eq!(depths.waiting, 9);
    assert_eq!(depths.free, 0);
    assert_slots_conserved(&h);

    h.run_to_idle();

    let mut ids: Vec<u64> = h.completions().iter().map(|c| c.request.raw()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..16).collect::<Vec<_>>());
    assert!(h.completions().iter().all(|c| c.outcome == Outcome::Success));
    assert_eq!(h.adapter.queue_depths().free, 7);
    assert_slots_conserved(&h);
}

#[test]
fn test_busy_doorbell_requeues_behind_active_work() {
    let h = Harness::new(HbaConfig::new().with_issue_limits(8, 10));
    h.read(1, 0, contiguous(0x4000_0000, 4 * KIB));
    h.adapter.with_hardware(|hw| hw.stuck = true);
    h.read(2, 8, contiguous(0x4001_0000, 4 * KIB));

    // Request 1 is in flight, so its completion re-runs the pass
    assert_eq!(h.started_count(), 1);
    assert_eq!(h.adapter.queue_depths().waiting, 1);
    assert_eq!(h.adapter.stats().issue_busy, 1);
    assert_slots_conserved(&h);
    assert!(h.completions().is_empty());

    h.adapter.with_hardware(|hw| hw.stuck = false);
    h.complete(0, basic::SUCCESS, 0);
    assert_eq!(h.started_count(), 2);
    h.mark_posted();
    h.complete(1, basic::SUCCESS, 0);
    assert_eq!(h.outcome_of(1), [Outcome::Success]);
    assert_eq!(h.outcome_of(2), [Outcome::Success]);
}

#[test]
fn test_busy_doorbell_on_idle_adapter_retried_in_same_pass() {
    let h = Harness::new(HbaConfig::new().with_issue_limits(4, 10));
    // Busy for the whole first issue and part of the second
    h.adapter.with_hardware(|hw| hw.busy_polls = 6);
    h.read(1, 0, contiguous(0x4000_0000, 4 * KIB));

    assert_eq!(h.started_count(), 1);
    assert_eq!(h.adapter.queue_depths().waiting, 0);
    assert_eq!(h.adapter.stats().issue_busy, 1);

    h.run_to_idle();
    assert_eq!(h.outcome_of(1), [Outcome::Success]);
}

#[test]
fn test_busy_retry_limit_fails_request_on_idle_adapter() {
    let h = Harness::new(HbaConfig::new().with_issue_limits(4, 3));
    h.adapter.with_hardware(|hw| hw.stuck = true);
    h.read(1, 0, contiguous(0x4000_0000, 4 * KIB));

    // Nothing else will run the pass again, so the request is settled now
    assert_eq!(h.outcome_of(1), [Outcome::FatalError]);
    assert_eq!(h.started_count(), 0);
    assert_eq!(h.adapter.stats().issue_busy, 3);
    let depths = h.adapter.queue_depths();
    assert_eq!(depths.waiting, 0);
    assert_eq!(depths.free, HbaConfig::DEFAULT_POOL_SIZE - 1);
}

#[test]
fn test_busy_admin_on_idle_adapter_settled() {
    let config = HbaConfig::new()
        .with_issue_limits(4, 2)
        .with_admin_wait(WaitMode::Polled { budget: 5 });
    let h = Harness::new(config);
    h.adapter.with_hardware(|hw| hw.stuck = true);

    let request = AdminRequest::new(RequestId::new(1), AdminOpcode::Enquiry);
    assert_eq!(h.adapter.submit_admin(request), Ok(Outcome::FatalError));
    assert_eq!(h.adapter.queue_depths().admin_waiting, 0);
    assert_eq!(h.adapter.queue_depths().admin_waiters, 0);
}

// =============================================================================
// Abort and Reset
// =============================================================================

#[test]
fn test_abort_queued_request() {
    let h = Harness::new(HbaConfig::new().with_pool_size(4));
    for id in 1..=4 {
        h.read(id, 0, contiguous(0x4000_0000 + id * 0x1_0000, 512));
    }
    assert_eq!(h.started_count(), 3);

    assert!(h.adapter.abort(RequestId::new(4)));
    assert_eq!(h.outcome_of(4), [Outcome::Cancelled]);
    assert_eq!(h.started_count(), 3);

    // In flight: only a reset can stop it
    assert!(!h.adapter.abort(RequestId::new(1)));
    assert_eq!(h.adapter.queue_depths().active, 3);
    assert!(h.outcome_of(1).is_empty());

    assert!(!h.adapter.abort(RequestId::new(99)));
    assert_eq!(h.adapter.stats().aborted, 1);

    h.run_to_idle();
    assert_eq!(h.outcome_of(4), [Outcome::Cancelled]);
    assert_eq!(h.completions().len(), 4);
}

#[test]
fn test_reset_fails_active_and_resumes_queued() {
    let h = Harness::new(HbaConfig::new().with_pool_size(4));
    for id in 1..=5 {
        h.read(id, 0, contiguous(0x4000_0000 + id * 0x1_0000, 512));
    }
    assert_eq!(h.adapter.queue_depths().active, 3);
    assert_eq!(h.adapter.queue_depths().waiting, 2);
    h.mark_posted();

    assert!(h.adapter.reset());
    for id in 1..=3 {
        assert_eq!(h.outcome_of(id), [Outcome::DeviceReset]);
    }
    assert!(h.outcome_of(4).is_empty());
    assert_eq!(h.started_count(), 5);
    assert_eq!(h.adapter.queue_depths().active, 2);
    assert_slots_conserved(&h);
    assert_eq!(h.adapter.reset_generation(), 1);
    assert_eq!(h.adapter.with_hardware(|hw| hw.resets), 1);

    h.run_to_idle();
    assert_eq!(h.outcome_of(4), [Outcome::Success]);
    assert_eq!(h.outcome_of(5), [Outcome::Success]);
    assert_eq!(h.completions().len(), 5);
    assert_slots_conserved(&h);
}

#[test]
fn test_failed_reset_makes_adapter_unavailable() {
    let h = Harness::new(HbaConfig::default());
    h.read(1, 0, contiguous(0x4000_0000, 512));
    h.adapter.with_hardware(|hw| hw.reset_ok = false);

    assert!(!h.adapter.reset());
    assert!(h.adapter.flags().contains(AdapterFlags::UNAVAILABLE));
    assert_eq!(h.outcome_of(1), [Outcome::FatalError]);

    h.read(2, 0, contiguous(0x4000_0000, 512));
    assert_eq!(h.outcome_of(2), [Outcome::FatalError]);
    assert_eq!(h.started_count(), 1);

    let admin = AdminRequest::new(RequestId::new(3), AdminOpcode::Enquiry);
    assert_eq!(h.adapter.submit_admin(admin), Err(HbaError::Unavailable));
    assert!(!h.adapter.reset());
}

// =============================================================================
// Local Replies and Passthrough
// =============================================================================

#[test]
fn test_logical_inquiry_answered_locally() {
    let h = Harness::new(HbaConfig::default());
    let cdb = Cdb::new(&[opcode::INQUIRY, 0, 0, 0, 36, 0]).unwrap();
    h.adapter.submit(h.request(1, TargetAddr::logical(0), cdb));

    let missing = Cdb::new(&[opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0]).unwrap();
    h.adapter.submit(h.request(2, TargetAddr::logical(5), missing));

    assert_eq!(h.started_count(), 0);
    let done = h.completions();
    assert_eq!(done[0].outcome, Outcome::Success);
    assert_eq!(done[0].reply.as_ref().map(Vec::len), Some(36));
    assert_eq!(done[1].outcome, Outcome::RetryableTimeout);
    assert_eq!(h.adapter.stats().immediate, 2);
}

#[test]
fn test_one_passthrough_per_physical_target() {
    let h = Harness::new(HbaConfig::default());
    let inquiry = || Cdb::new(&[opcode::INQUIRY, 0, 0, 0, 36, 0]).unwrap();
    let busy_target = TargetAddr::physical(1, 2);

    for id in 1..=2 {
        let req = h.request(id, busy_target, inquiry()).with_data(contiguous(0x5000_0000 + id * 0x1000, 36));
        h.adapter.submit(req);
    }
    let other = h.request(3, TargetAddr::physical(1, 3), inquiry()).with_data(contiguous(0x5000_8000, 36));
    h.adapter.submit(other);

    // The second request to the busy target is skipped, not the one behind it
    assert_eq!(h.started_count(), 2);
    assert_eq!(h.adapter.queue_depths().waiting, 1);
    match &h.started()[0] {
        NativeCommand::Dcdb(dcdb) => {
            assert_eq!(dcdb.device_address, 0x12);
            assert_eq!(dcdb.transfer_length, 36);
        }
        other => panic!("expected DCDB, got {:?}", other),
    }

    h.complete(0, basic::SUCCESS, 0);
    assert_eq!(h.started_count(), 3);
    h.mark_posted();
    h.complete(1, basic::SUCCESS, 0);
    h.complete(2, basic::SUCCESS, 0);
    assert_eq!(h.completions().len(), 3);
}

#[test]
fn test_hidden_physical_disk_inquiry() {
    let h = Harness::new(HbaConfig::default());
    let cdb = Cdb::new(&[opcode::INQUIRY, 0, 0, 0, 36, 0]).unwrap();
    h.adapter.submit(h.request(1, TargetAddr::physical(2, 0), cdb).with_data(contiguous(0x5000_0000, 36)));
    h.complete(0, basic::PHYS_DRV_ERROR, extended::OU_RUN);
    assert_eq!(h.outcome_of(1), [Outcome::RetryableTimeout]);
}

#[test]
fn test_recovered_passthrough_carries_sense() {
    let h = Harness::new(HbaConfig::default());
    h.adapter.with_hardware(|hw| {
        hw.sense[0] = 0x70;
        hw.sense[2] = 0x01;
    });
    let cdb = read10(0, 1);
    h.adapter.submit(h.request(1, TargetAddr::physical(1, 0), cdb).with_data(contiguous(0x5000_0000, 512)));
    h.complete(0, basic::RECOVERED, 0);

    let done = h.completions();
    assert_eq!(done[0].outcome, Outcome::Success);
    assert_eq!(done[0].transferred, 512);
    assert_eq!(done[0].sense.as_ref().map(|s| s[2]), Some(0x01));
}

#[test]
fn test_passthrough_underrun_reported_short() {
    let h = Harness::new(HbaConfig::default());
    let cdb = read10(0, 8);
    h.adapter.submit(h.request(1, TargetAddr::physical(1, 0), cdb).with_data(contiguous(0x5000_0000, 4096)));
    h.complete(0, basic::PHYS_DRV_ERROR, extended::OU_RUN);

    h.adapter.submit(h.request(2, TargetAddr::physical(1, 0), read10(8, 8)).with_data(contiguous(0x5000_0000, 4096)));
    h.complete(1, basic::SUCCESS, 0);

    let done = h.completions();
    assert_eq!(done[0].outcome, Outcome::Success);
    assert!(done[0].underrun);
    assert_eq!(done[0].transferred, 4096);
    assert!(!done[1].underrun);
}

#[test]
fn test_oversized_passthrough_rejected() {
    let h = Harness::new(HbaConfig::default());
    let cdb = read10(0, 512);
    let data = contiguous(0x5000_0000, 256 * KIB);
    h.adapter.submit(h.request(1, TargetAddr::physical(1, 0), cdb).with_data(data));
    assert_eq!(h.outcome_of(1), [Outcome::FatalError]);
    assert_eq!(h.started_count(), 0);
}

// =============================================================================
// Administrative Commands
// =============================================================================

#[test]
fn test_blocking_admin_woken_by_interrupt() {
    let h = Harness::new(HbaConfig::default());
    let adapter = h.adapter.clone();
    let submitter = thread::spawn(move || {
        adapter.submit_admin(AdminRequest::new(RequestId::new(1), AdminOpcode::Enquiry).with_param(7))
    });

    wait_until(|| h.started_count() == 1);
    match &h.started()[0] {
        NativeCommand::Admin(cmd) => {
            assert_eq!(cmd.opcode, AdminOpcode::Enquiry);
            assert_eq!(cmd.param, 7);
        }
        other => panic!("expected admin command, got {:?}", other),
    }
    h.complete(0, basic::SUCCESS, 0);

    assert_eq!(submitter.join().unwrap(), Ok(Outcome::Success));
    assert_eq!(h.adapter.queue_depths().admin_active, 0);
}

#[test]
fn test_abort_queued_admin_request() {
    let h = Harness::new(HbaConfig::default());
    let first = spawn_admin(&h, 1);
    wait_until(|| h.started_count() == 1);
    // Concurrency is one, so the second request waits in the admin queue
    let second = spawn_admin(&h, 2);
    wait_until(|| h.adapter.queue_depths().admin_waiting == 1);

    assert!(h.adapter.abort(RequestId::new(2)));
    assert_eq!(second.join().unwrap(), Ok(Outcome::Cancelled));
    assert_eq!(h.started_count(), 1);
    assert_eq!(h.adapter.queue_depths().admin_waiting, 0);

    assert!(!h.adapter.abort(RequestId::new(1)));
    assert_eq!(h.adapter.queue_depths().admin_active, 1);
    assert_eq!(h.adapter.stats().aborted, 1);

    h.complete(0, basic::SUCCESS, 0);
    assert_eq!(first.join().unwrap(), Ok(Outcome::Success));
    assert_eq!(h.adapter.queue_depths().admin_waiters, 0);
}

#[test]
fn test_reset_settles_admin_waiters_once() {
    let h = Harness::new(HbaConfig::new().with_pool_size(4));
    h.read(10, 0, contiguous(0x4000_0000, 512));
    let active = spawn_admin(&h, 1);
    wait_until(|| h.started_count() == 2);
    let queued = spawn_admin(&h, 2);
    wait_until(|| h.adapter.queue_depths().admin_waiting == 1);

    assert!(h.adapter.reset());
    assert_eq!(active.join().unwrap(), Ok(Outcome::DeviceReset));
    assert_eq!(queued.join().unwrap(), Ok(Outcome::DeviceReset));
    assert_eq!(h.outcome_of(10), [Outcome::DeviceReset]);

    let depths = h.adapter.queue_depths();
    assert_eq!(depths.admin_waiting, 0);
    assert_eq!(depths.admin_active, 0);
    assert_eq!(depths.admin_waiters, 0);
    assert_eq!(depths.active, 0);
    assert_slots_conserved(&h);
    // The queued admin request was failed, not dispatched after the reset
    assert_eq!(h.started_count(), 2);
}

#[test]
fn test_polled_admin() {
    let config = HbaConfig::new().with_admin_wait(WaitMode::Polled { budget: 50 });
    let h = Harness::new(config);
    h.adapter.with_hardware(|hw| hw.auto_complete = true);

    let request = AdminRequest::new(RequestId::new(1), AdminOpcode::GetLogicalDriveInfo)
        .with_buffer(DmaSegment::new(0x6000_0000, 4096));
    assert_eq!(h.adapter.submit_admin(request), Ok(Outcome::Success));
    assert_eq!(h.adapter.queue_depths().admin_active, 0);
}

#[test]
fn test_polled_admin_budget_exhausted() {
    let config = HbaConfig::new().with_admin_wait(WaitMode::Polled { budget: 5 });
    let h = Harness::new(config);

    let request = AdminRequest::new(RequestId::new(1), AdminOpcode::ReadConfiguration);
    assert_eq!(h.adapter.submit_admin(request), Ok(Outcome::RetryableTimeout));
    assert_eq!(h.adapter.queue_depths().admin_active, 1);

    // The late completion reclaims the abandoned waiter
    h.complete(0, basic::SUCCESS, 0);
    assert_eq!(h.adapter.queue_depths().admin_active, 0);

    h.adapter.with_hardware(|hw| hw.auto_complete = true);
    let again = AdminRequest::new(RequestId::new(2), AdminOpcode::ReadConfiguration);
    assert_eq!(h.adapter.submit_admin(again), Ok(Outcome::Success));
}

#[test]
fn test_admin_waiters_exhausted() {
    let mut config = HbaConfig::new().with_admin_wait(WaitMode::Polled { budget: 1 });
    config.admin_queue_depth = 1;
    let h = Harness::new(config);

    let first = AdminRequest::new(RequestId::new(1), AdminOpcode::Enquiry);
    assert_eq!(h.adapter.submit_admin(first), Ok(Outcome::RetryableTimeout));

    // The abandoned waiter is still held by the command in flight
    let second = AdminRequest::new(RequestId::new(2), AdminOpcode::Enquiry);
    assert_eq!(h.adapter.submit_admin(second), Err(HbaError::ResourceExhausted));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_detach_fails_leftover_work_and_flushes() {
    let h = Harness::new(HbaConfig::new().with_pool_size(2));
    h.read(1, 0, contiguous(0x4000_0000, 512));
    h.read(2, 0, contiguous(0x4000_1000, 512));
    h.adapter.with_hardware(|hw| hw.auto_complete = true);

    let Harness { adapter, log, .. } = h;
    let adapter = Arc::try_unwrap(adapter).ok().unwrap();
    let hw = adapter.detach();

    let flush = hw.started.last().map(|(_, c)| c.clone()).unwrap();
    assert!(matches!(flush, NativeCommand::Admin(ref cmd) if cmd.opcode == AdminOpcode::Flush));
    let outcomes: Vec<Outcome> = log.lock().iter().map(|c| c.outcome).collect();
    assert_eq!(outcomes, [Outcome::FatalError, Outcome::FatalError]);
}
