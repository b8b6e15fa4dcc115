//! Submission tracking and sync tokens.
//!
//! A [`SubmissionTracker`] is shared by a command buffer and every
//! [`SyncToken`] it hands out. It owns the completion fence and semaphore and
//! outlives buffer resets: a token taken before a reset can still be waited on
//! after the buffer has moved on.
//!
//! The completion semaphore is binary. A submission signals it only when
//! asked to, and the next signaling submission is refused until some
//! consumer has claimed the semaphore to wait on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use gpurt_core::{Result, RuntimeError};

use crate::driver::{Driver, SemaphoreWait};

/// Lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Invalid,
    Initial,
    Recording,
    Executable,
    Pending,
    Complete,
}

impl CommandBufferState {
    pub fn name(self) -> &'static str {
        match self {
            CommandBufferState::Invalid => "invalid",
            CommandBufferState::Initial => "initial",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Executable => "executable",
            CommandBufferState::Pending => "pending",
            CommandBufferState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct SubmissionTracker {
    driver: Arc<dyn Driver>,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    state: Mutex<CommandBufferState>,
    /// Number of submissions that reached the queue; 0 means never submitted.
    submit_id: AtomicU64,
    /// Highest submission known complete without asking the fence.
    completed_id: AtomicU64,
    /// The semaphore has a signal queued that no consumer has claimed.
    signal_unclaimed: AtomicBool,
    default_timeout_ns: u64,
}

impl SubmissionTracker {
    pub(crate) fn new(driver: &Arc<dyn Driver>, default_timeout_ns: u64) -> Result<Self> {
        let fence = driver
            .create_fence(false)
            .map_err(|e| RuntimeError::driver("create_fence", e))?;
        let semaphore = match driver.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                driver.destroy_fence(fence);
                return Err(RuntimeError::driver("create_semaphore", e));
            }
        };
        Ok(Self {
            driver: Arc::clone(driver),
            fence,
            semaphore,
            state: Mutex::new(CommandBufferState::Invalid),
            submit_id: AtomicU64::new(0),
            completed_id: AtomicU64::new(0),
            signal_unclaimed: AtomicBool::new(false),
            default_timeout_ns,
        })
    }

    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Signaled by submissions made with `submit_signaling`.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn submit_id(&self) -> u64 {
        self.submit_id.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CommandBufferState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: CommandBufferState) {
        *self.state.lock() = state;
    }

    /// Make the fence ready for the next submission.
    ///
    /// The previous submission is complete by now (a buffer only returns to
    /// `Executable` through a reset, which requires completion), so it is
    /// recorded as such before the fence it was judged by is reset. The
    /// submission counter does not move here; see [`commit_submit`](Self::commit_submit).
    pub(crate) fn arm_fence(&self) -> Result<()> {
        let previous = self.submit_id();
        if previous > 0 {
            self.completed_id.fetch_max(previous, Ordering::AcqRel);
            self.driver
                .reset_fence(self.fence)
                .map_err(|e| RuntimeError::driver("reset_fence", e))?;
        }
        Ok(())
    }

    /// Record a submission the queue accepted. Returns its id.
    pub(crate) fn commit_submit(&self) -> u64 {
        self.submit_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reserve the completion semaphore for a signaling submission.
    pub(crate) fn reserve_signal(&self) -> Result<()> {
        self.signal_unclaimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RuntimeError::SemaphoreUnclaimed {
                submit_id: self.submit_id(),
            })
    }

    /// Undo [`reserve_signal`](Self::reserve_signal) after a failed submission.
    pub(crate) fn cancel_signal(&self) {
        self.signal_unclaimed.store(false, Ordering::Release);
    }

    /// Hand the signaled semaphore to one consumer. Returns `None` when no
    /// signal is outstanding or it was already claimed.
    pub fn claim_semaphore(&self) -> Option<vk::Semaphore> {
        self.signal_unclaimed
            .swap(false, Ordering::AcqRel)
            .then_some(self.semaphore)
    }

    /// Non-blocking completion check for submission `captured`.
    pub fn is_complete(&self, captured: u64) -> Result<bool> {
        if captured == 0
            || captured < self.submit_id()
            || captured <= self.completed_id.load(Ordering::Acquire)
        {
            return Ok(true);
        }
        let signaled = self
            .driver
            .fence_status(self.fence)
            .map_err(|e| RuntimeError::driver("get_fence_status", e))?;
        if signaled {
            self.observe_complete();
        }
        Ok(signaled)
    }

    /// Block until submission `captured` completes or the timeout elapses.
    /// Returns `Ok(false)` on timeout.
    pub fn wait(&self, captured: u64, timeout_ns: u64) -> Result<bool> {
        if self.is_complete(captured)? {
            return Ok(true);
        }
        let signaled = self
            .driver
            .wait_for_fence(self.fence, timeout_ns)
            .map_err(|e| RuntimeError::driver("wait_for_fences", e))?;
        if signaled {
            self.observe_complete();
        } else {
            warn!(submit_id = captured, timeout_ns, "fence wait timed out");
        }
        Ok(signaled)
    }

    fn observe_complete(&self) {
        let mut state = self.state.lock();
        if *state == CommandBufferState::Pending {
            *state = CommandBufferState::Complete;
            debug!(submit_id = self.submit_id(), "submission complete");
        }
    }

    pub fn default_timeout_ns(&self) -> u64 {
        self.default_timeout_ns
    }
}

impl Drop for SubmissionTracker {
    fn drop(&mut self) {
        self.driver.destroy_semaphore(self.semaphore);
        self.driver.destroy_fence(self.fence);
    }
}

impl std::fmt::Debug for SubmissionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionTracker")
            .field("fence", &self.fence)
            .field("state", &self.state())
            .field("submit_id", &self.submit_id())
            .finish()
    }
}

/// Snapshot of one submission of one command buffer.
///
/// A token whose captured id is behind the tracker's current id refers to
/// work that has necessarily finished: the buffer could only be resubmitted
/// after that submission completed.
#[derive(Clone)]
pub struct SyncToken {
    tracker: Arc<SubmissionTracker>,
    submit_id: u64,
}

impl SyncToken {
    pub(crate) fn new(tracker: Arc<SubmissionTracker>) -> Self {
        let submit_id = tracker.submit_id();
        Self { tracker, submit_id }
    }

    pub fn submit_id(&self) -> u64 {
        self.submit_id
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.tracker.is_complete(self.submit_id)
    }

    /// Wait using the configured default timeout (unbounded unless configured).
    pub fn wait_for_complete(&self) -> Result<bool> {
        self.tracker
            .wait(self.submit_id, self.tracker.default_timeout_ns())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.tracker.wait(self.submit_id, timeout_ns)
    }

    /// Like [`wait_timeout`](Self::wait_timeout) but a timeout is an error.
    pub fn wait_or_timeout(&self, timeout_ns: u64) -> Result<()> {
        if self.tracker.wait(self.submit_id, timeout_ns)? {
            Ok(())
        } else {
            Err(RuntimeError::Timeout { timeout_ns })
        }
    }

    /// Claim the completion semaphore this token's submission signaled, to
    /// add it to another submission's wait list. Only the latest signaling
    /// submission can be claimed, and only once.
    pub fn claim_semaphore(&self) -> Option<vk::Semaphore> {
        if self.submit_id != self.tracker.submit_id() {
            return None;
        }
        self.tracker.claim_semaphore()
    }

    /// True when both tokens were taken from the same command buffer.
    pub fn same_tracker(&self, other: &SyncToken) -> bool {
        Arc::ptr_eq(&self.tracker, &other.tracker)
    }
}

impl std::fmt::Debug for SyncToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncToken")
            .field("submit_id", &self.submit_id)
            .field("tracker_submit_id", &self.tracker.submit_id())
            .finish()
    }
}

#[derive(Debug, Default)]
struct PendingSemaphores {
    waits: Vec<SemaphoreWait>,
    signals: Vec<vk::Semaphore>,
}

/// Semaphores queued for the next submission of a command stream.
///
/// Several producers may enqueue before a single submission drains the list;
/// this is the only mutex on the submission path.
#[derive(Debug, Default)]
pub struct WaitList {
    pending: Mutex<PendingSemaphores>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_wait(&self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.pending.lock().waits.push(SemaphoreWait { semaphore, stage });
    }

    pub fn add_signal(&self, semaphore: vk::Semaphore) {
        self.pending.lock().signals.push(semaphore);
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> (Vec<SemaphoreWait>, Vec<vk::Semaphore>) {
        let mut pending = self.pending.lock();
        (
            std::mem::take(&mut pending.waits),
            std::mem::take(&mut pending.signals),
        )
    }

    /// Put back what a failed submission drained, ahead of anything enqueued
    /// since.
    pub(crate) fn requeue(&self, mut waits: Vec<SemaphoreWait>, mut signals: Vec<vk::Semaphore>) {
        let mut pending = self.pending.lock();
        waits.append(&mut pending.waits);
        signals.append(&mut pending.signals);
        pending.waits = waits;
        pending.signals = signals;
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        pending.waits.is_empty() && pending.signals.is_empty()
    }
}
