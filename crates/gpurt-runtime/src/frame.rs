//! Round-robin of per-frame command buffers.
//!
//! After each submission the ring moves to the next frame. If that frame's
//! previous submission has not completed, the ring grows by inserting a fresh
//! frame instead of blocking the host. The GPU eventually catches up, which
//! bounds the growth in practice; `max_frames` turns it into a hard bound at
//! which the ring waits on the oldest frame instead.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use gpurt_core::config::FrameRingConfig;
use gpurt_core::{Result, RuntimeError};

use crate::command::CommandBuffer;
use crate::driver::Driver;
use crate::sync::{CommandBufferState, SyncToken};

/// One slot of the ring: a command buffer (with its fence and completion
/// semaphore) and a semaphore for the presentation engine to signal.
pub struct Frame {
    driver: Arc<dyn Driver>,
    command_buffer: CommandBuffer,
    present_semaphore: vk::Semaphore,
}

impl Frame {
    fn new(driver: &Arc<dyn Driver>, default_timeout_ns: u64) -> Result<Self> {
        let command_buffer = CommandBuffer::new(driver, default_timeout_ns)?;
        let present_semaphore = driver
            .create_semaphore()
            .map_err(|e| RuntimeError::driver("create_semaphore", e))?;
        Ok(Self {
            driver: Arc::clone(driver),
            command_buffer,
            present_semaphore,
        })
    }

    pub fn command_buffer(&mut self) -> &mut CommandBuffer {
        &mut self.command_buffer
    }

    pub fn fence(&self) -> vk::Fence {
        self.command_buffer.tracker().fence()
    }

    /// Signaled only by [`FrameRing::submit_signaling`]; a consumer claims it
    /// through the returned token.
    pub fn completion_semaphore(&self) -> vk::Semaphore {
        self.command_buffer.tracker().semaphore()
    }

    /// Semaphore the presentation engine signals before this frame may draw.
    /// Callers add it to the frame's wait list when they use it.
    pub fn present_semaphore(&self) -> vk::Semaphore {
        self.present_semaphore
    }

    fn is_available(&self) -> Result<bool> {
        Ok(matches!(
            self.command_buffer.poll()?,
            CommandBufferState::Initial | CommandBufferState::Complete
        ))
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // The submission may still wait on the present semaphore.
        if let Err(e) = self.command_buffer.get_sync().wait_for_complete() {
            warn!("frame wait on drop failed: {}", e);
        }
        self.driver.destroy_semaphore(self.present_semaphore);
    }
}

pub struct FrameRing {
    driver: Arc<dyn Driver>,
    frames: Vec<Frame>,
    current: usize,
    max_frames: Option<usize>,
    default_timeout_ns: u64,
}

impl FrameRing {
    pub(crate) fn new(
        driver: &Arc<dyn Driver>,
        config: &FrameRingConfig,
        default_timeout_ns: u64,
    ) -> Result<Self> {
        let initial = config.initial_frames.max(1);
        let frames = (0..initial)
            .map(|_| Frame::new(driver, default_timeout_ns))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            driver: Arc::clone(driver),
            frames,
            current: 0,
            max_frames: config.max_frames,
            default_timeout_ns,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The frame to record into.
    pub fn current(&mut self) -> &mut Frame {
        &mut self.frames[self.current]
    }

    /// Submit the current frame's command buffer and advance to a frame that
    /// is ready for recording (already reset to `Initial`).
    ///
    /// A bounded ring at capacity waits for the next frame before submitting,
    /// so a timeout leaves the current frame unsubmitted and the call can be
    /// retried.
    pub fn submit(&mut self) -> Result<SyncToken> {
        self.submit_frame(false)
    }

    /// Like [`submit`](Self::submit), also signaling the frame's completion
    /// semaphore (for presentation to wait on).
    pub fn submit_signaling(&mut self) -> Result<SyncToken> {
        self.submit_frame(true)
    }

    fn submit_frame(&mut self, signal_completion: bool) -> Result<SyncToken> {
        let next = self.next_index();
        if next != self.current && self.at_capacity() && !self.frames[next].is_available()? {
            debug!(frame = next, "frame ring at capacity, waiting on oldest frame");
            let token = self.frames[next].command_buffer.get_sync();
            token.wait_or_timeout(self.default_timeout_ns)?;
        }
        let command_buffer = &mut self.frames[self.current].command_buffer;
        let token = if signal_completion {
            command_buffer.submit_signaling()?
        } else {
            command_buffer.submit()?
        };
        self.advance()?;
        Ok(token)
    }

    fn next_index(&self) -> usize {
        (self.current + 1) % self.frames.len()
    }

    fn at_capacity(&self) -> bool {
        self.max_frames.is_some_and(|max| self.frames.len() >= max)
    }

    fn advance(&mut self) -> Result<()> {
        let next = self.next_index();
        if self.frames[next].is_available()? {
            self.current = next;
        } else if self.at_capacity() {
            let token = self.frames[next].command_buffer.get_sync();
            debug!(frame = next, "frame ring at capacity, waiting on oldest frame");
            token.wait_or_timeout(self.default_timeout_ns)?;
            self.current = next;
        } else {
            let frame = Frame::new(&self.driver, self.default_timeout_ns)?;
            self.current += 1;
            self.frames.insert(self.current, frame);
            info!(frames = self.frames.len(), "frame ring grew");
            return Ok(());
        }

        let command_buffer = &mut self.frames[self.current].command_buffer;
        if command_buffer.state() != CommandBufferState::Initial {
            command_buffer.reset()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("frames", &self.frames.len())
            .field("current", &self.current)
            .field("max_frames", &self.max_frames)
            .finish()
    }
}
