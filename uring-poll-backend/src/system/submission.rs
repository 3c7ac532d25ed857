//! Arming, submitting and cancelling watches.
//!
//! A watch goes through the *submit list* before it reaches the kernel:
//! [`Backend::arm`] only reserves a slot. [`Backend::submit_batch`] turns the
//! whole list into poll-add entries and hands them over in chunks of
//! [`crate::BackendOptions::max_submit`].

use tracing::{debug, trace};

use crate::ops::{poll_add::Target, poll_remove::PollRemove, Watch};

use super::completion::EventHandler;
use super::lifecycle::{is_retryable, Backend};
use super::slots::{Op, SlotId, SlotState};
use super::WaitMode;

#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("no free slot")]
    NoCapacity,
    #[error("registered descriptor index {0} is not bound")]
    NotRegistered(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("io_uring_enter failed")]
    Kernel(#[source] std::io::Error),
}

/// The cancellation was not issued. The watch may still be pending.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("no free slot for the cancellation")]
    NoCapacity,
    #[error("slot {0:?} holds no cancellable watch")]
    NotInFlight(SlotId),
    #[error("submitting the cancellation failed")]
    Submit(#[source] SubmitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The watch had not been submitted yet. Its slot was released on the spot
    /// and no completion will be delivered for it.
    Disarmed,
    /// A poll-remove is in flight in the given slot. Both its completion and
    /// the watch's own completion will be delivered.
    Issued(SlotId),
}

impl Backend {
    /// Reserve a slot for `watch` and put it on the submit list.
    pub fn arm(&mut self, watch: Watch) -> Result<SlotId, ArmError> {
        if let Target::Registered(index) = watch.target {
            if !self.registry.is_bound(index) {
                return Err(ArmError::NotRegistered(index));
            }
        }
        let slot = self
            .slots
            .allocate(Op::PollAdd(watch))
            .ok_or(ArmError::NoCapacity)?;
        if let Target::Registered(index) = watch.target {
            self.registry.acquire(index);
        }
        self.slots.push_submit(slot);
        trace!(id = self.id, ?slot, ?watch, "armed");
        Ok(slot)
    }

    /// Hand queued entries to the kernel without waiting.
    ///
    /// A full completion queue makes the kernel refuse submissions; that is
    /// resolved by draining completions into `handler` and trying again.
    pub fn submit_non_blocking<H: EventHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<usize, SubmitError> {
        self.enter(WaitMode::DontWait, handler)
    }

    /// Like [`Self::submit_non_blocking`], then block until a completion is available.
    pub fn submit_and_wait<H: EventHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<usize, SubmitError> {
        self.enter(WaitMode::Wait, handler)
    }

    fn enter<H: EventHandler>(
        &mut self,
        wait_mode: WaitMode,
        handler: &mut H,
    ) -> Result<usize, SubmitError> {
        loop {
            #[cfg(test)]
            if self.inject_busy > 0 {
                self.inject_busy -= 1;
                let drained = self.drain(WaitMode::DontWait, handler)?;
                debug!(id = self.id, drained, "injected EBUSY, drained before resubmitting");
                continue;
            }
            let res = match wait_mode {
                WaitMode::Wait => self.ring.submit_and_wait(1),
                WaitMode::DontWait => self.ring.submit(),
            };
            match res {
                Ok(submitted) => {
                    self.unsubmitted -= submitted.min(self.unsubmitted);
                    return Ok(submitted);
                }
                Err(e) if e.raw_os_error() == Some(uring_common::libc::EINTR) => {}
                Err(e) if is_retryable(&e) => {
                    let drained = self.drain(WaitMode::DontWait, handler)?;
                    debug!(id = self.id, drained, "completion queue full, drained before resubmitting");
                    if drained == 0 {
                        std::thread::yield_now();
                    }
                }
                Err(e) => return Err(SubmitError::Kernel(e)),
            }
        }
    }

    /// Submit everything on the submit list. Returns how many watches were submitted.
    ///
    /// Entries go to the kernel in chunks of at most `max_submit`. All chunks
    /// but the last are submitted without waiting; the last one honors
    /// `wait_mode`. With an empty submit list nothing is submitted and the
    /// call never blocks.
    ///
    /// Handlers running during the call (see [`Self::submit_non_blocking`])
    /// may disarm watches that were listed when it started; those are not
    /// counted. On error, the watches already queued go out with the next
    /// submission.
    pub fn submit_batch<H: EventHandler>(
        &mut self,
        wait_mode: WaitMode,
        handler: &mut H,
    ) -> Result<usize, SubmitError> {
        let total = self.slots.submit_len();
        let mut done = 0;
        let mut waited = false;
        while done < total {
            let limit = (total - done).min(self.options.max_submit);
            let mut chunk = 0;
            while chunk < limit {
                // handlers may have submitted or disarmed what was listed
                let Some(slot) = self.slots.pop_submit() else {
                    break;
                };
                let Op::PollAdd(watch) = self.slots.op(slot) else {
                    panic!("implementation error: non-watch slot {slot:?} on the submit list");
                };
                if let Err(e) = self.push_sqe(&watch.make_sqe().user_data(slot.tag()), handler) {
                    self.slots.push_submit(slot);
                    return Err(e);
                }
                self.slots.set_state(slot, SlotState::Submitted);
                self.slots.push_active(slot);
                chunk += 1;
            }
            if chunk == 0 {
                break;
            }
            done += chunk;
            let queued = self.unsubmitted;
            let mode = if done == total || self.slots.submit_len() == 0 {
                wait_mode
            } else {
                WaitMode::DontWait
            };
            waited = mode == WaitMode::Wait;
            self.enter(mode, handler)?;
            // the kernel only sees what was queued; anything left over means the rings disagree
            assert_eq!(
                self.unsubmitted, 0,
                "implementation error: kernel left {} of {queued} entries unsubmitted",
                self.unsubmitted
            );
            #[cfg(test)]
            self.chunk_sizes.push(chunk);
            trace!(id = self.id, chunk, "submitted chunk");
        }
        if done > 0 && wait_mode == WaitMode::Wait && !waited {
            // the list emptied under a handler before the last chunk went out
            self.enter(WaitMode::Wait, handler)?;
        }
        Ok(done)
    }

    /// Stop a watch.
    ///
    /// A watch still on the submit list is dropped locally. A submitted one
    /// gets a poll-remove. Cancellation is asynchronous: until the watch's
    /// completion (usually `ECANCELED`) arrives, the watched descriptor must
    /// stay open.
    pub fn cancel<H: EventHandler>(
        &mut self,
        target: SlotId,
        handler: &mut H,
    ) -> Result<CancelOutcome, CancelError> {
        if !self.slots.is_current(target) || !matches!(self.slots.op(target), Op::PollAdd(_)) {
            return Err(CancelError::NotInFlight(target));
        }
        match self.slots.state(target) {
            SlotState::Armed if self.slots.is_on_submit_list(target) => {
                self.slots.unlink(target);
                self.release_slot(target);
                trace!(id = self.id, ?target, "disarmed before submission");
                return Ok(CancelOutcome::Disarmed);
            }
            SlotState::Submitted => {}
            SlotState::Free | SlotState::Armed | SlotState::Completing => {
                return Err(CancelError::NotInFlight(target));
            }
        }
        let remove = PollRemove { target };
        let slot = self
            .slots
            .allocate(Op::PollRemove(remove))
            .ok_or(CancelError::NoCapacity)?;
        self.slots.set_state(slot, SlotState::Submitted);
        let res = self
            .push_sqe(&remove.make_sqe().user_data(slot.tag()), handler)
            .and_then(|()| self.enter(WaitMode::DontWait, handler));
        if let Err(e) = res {
            // the entry may still reach the kernel; the generation bump makes its completion stale
            self.release_slot(slot);
            return Err(CancelError::Submit(e));
        }
        trace!(id = self.id, ?target, ?slot, "cancellation issued");
        Ok(CancelOutcome::Issued(slot))
    }
}
