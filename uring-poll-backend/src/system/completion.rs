//! Draining the completion queue and dispatching to an [`EventHandler`].

use std::os::fd::AsRawFd;

use tracing::{debug, error, trace, warn};
use uring_common::io_uring::cqueue;
use uring_common::{libc, Readiness};

use crate::ops::{poll_add::Target, poll_remove::PollRemove};

use super::lifecycle::Backend;
use super::slots::{Op, Resolved, SlotId, SlotState, Slots};
use super::submission::SubmitError;
use super::WaitMode;

/// Receives completions from [`Backend::drain`].
///
/// Callbacks may arm, submit and cancel through the backend. The slot a
/// completion refers to is reclaimed by the backend after the callback returns.
pub trait EventHandler {
    fn on_poll(&mut self, backend: &mut Backend, completion: PollCompletion);

    /// The backend's timerfd expired `expirations` times since the last call.
    fn on_timer(&mut self, backend: &mut Backend, expirations: u64) {
        let _ = (backend, expirations);
    }

    fn on_cancel(&mut self, backend: &mut Backend, completion: CancelCompletion) {
        let _ = (backend, completion);
    }
}

/// Completion of a watch.
#[derive(Debug, Clone, Copy)]
pub struct PollCompletion {
    pub slot: SlotId,
    /// The watch's [`crate::Watch::token`].
    pub token: u64,
    pub target: Target,
    /// Raw kernel result: poll flags, or a negated errno.
    pub result: i32,
    /// The watch stays armed and will complete again. Only ever set for
    /// persistent watches.
    pub still_armed: bool,
}

impl PollCompletion {
    pub fn readiness(&self) -> std::io::Result<Readiness> {
        if self.result < 0 {
            Err(std::io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(Readiness::from_poll_flags(self.result as u32))
        }
    }

    /// The watch ended because of [`Backend::cancel`].
    pub fn is_cancelled(&self) -> bool {
        self.result == -libc::ECANCELED
    }
}

/// Completion of a poll-remove issued by [`Backend::cancel`].
#[derive(Debug, Clone, Copy)]
pub struct CancelCompletion {
    pub slot: SlotId,
    /// The watch that was to be cancelled.
    pub target: SlotId,
    /// 0 on success; `-ENOENT` or `-EALREADY` if the watch completed first.
    pub result: i32,
}

/// Drops every completion. Used where no caller handler is around.
pub(crate) struct Discard;

impl EventHandler for Discard {
    fn on_poll(&mut self, _backend: &mut Backend, completion: PollCompletion) {
        trace!(?completion, "discarding poll completion");
    }
}

impl Backend {
    /// Dispatch up to [`crate::BackendOptions::max_get`] completions to `handler`.
    ///
    /// With [`WaitMode::Wait`], first block until at least one completion is
    /// available. Returns the number of completions processed.
    pub fn drain<H: EventHandler>(
        &mut self,
        wait_mode: WaitMode,
        handler: &mut H,
    ) -> Result<usize, SubmitError> {
        if wait_mode == WaitMode::Wait {
            while !self.ring.has_completions() {
                self.submit_and_wait(handler)?;
            }
        }
        let mut processed = 0;
        while processed < self.options.max_get {
            let Some(cqe) = self.ring.next_completion() else {
                break;
            };
            processed += 1;
            self.dispatch(cqe, handler);
        }
        trace!(id = self.id, processed, "drained");
        Ok(processed)
    }

    fn dispatch<H: EventHandler>(&mut self, cqe: cqueue::Entry, handler: &mut H) {
        let more = cqueue::more(cqe.flags());
        let result = cqe.result();
        let slot = match self.slots.resolve(cqe.user_data()) {
            Resolved::Live(slot) => slot,
            Resolved::Stale(slot) => {
                warn!(id = self.id, ?slot, result, "completion for released slot, ignoring");
                return;
            }
            Resolved::Detached => {
                trace!(id = self.id, result, "detached completion");
                return;
            }
        };
        trace!(id = self.id, ?slot, result, more, "completion");
        if slot == Slots::TIMER {
            self.on_timer_completion(result, more, handler);
            return;
        }
        match self.slots.op(slot) {
            Op::PollAdd(watch) => {
                let still_armed = watch.persistent && (more || result >= 0);
                if watch.persistent && more {
                    // multishot: the kernel keeps the poll, the slot stays on the active list
                } else if still_armed {
                    // the kernel ended the multishot stream without an error
                    self.slots.unlink(slot);
                    self.slots.set_state(slot, SlotState::Armed);
                    self.slots.push_submit(slot);
                } else {
                    self.slots.unlink(slot);
                    self.slots.set_state(slot, SlotState::Completing);
                }
                handler.on_poll(
                    self,
                    PollCompletion {
                        slot,
                        token: watch.token,
                        target: watch.target,
                        result,
                        still_armed,
                    },
                );
                if !still_armed {
                    self.release_slot(slot);
                }
            }
            Op::PollRemove(PollRemove { target }) => {
                self.slots.set_state(slot, SlotState::Completing);
                handler.on_cancel(
                    self,
                    CancelCompletion {
                        slot,
                        target,
                        result,
                    },
                );
                self.release_slot(slot);
            }
            op @ (Op::Vacant | Op::Timer) => {
                panic!("implementation error: completion for slot {slot:?} holding {op:?}")
            }
        }
    }

    fn on_timer_completion<H: EventHandler>(&mut self, result: i32, more: bool, handler: &mut H) {
        if !more {
            self.timer_state.in_flight = false;
        }
        if result == -libc::EINVAL && self.timer_state.multishot {
            debug!(id = self.id, "multishot poll unsupported, timer falls back to one-shot polls");
            self.timer_state.multishot = false;
        } else if result < 0 {
            if !self.timer_state.in_flight {
                error!(id = self.id, result, "timer poll failed, timer is dead");
            }
            return;
        } else {
            let expirations = self.read_timer();
            if expirations > 0 {
                handler.on_timer(self, expirations);
            }
        }
        if !self.timer_state.in_flight {
            self.rearm_timer(handler);
        }
    }

    /// Consume the timerfd's expiration count. 0 if nothing expired.
    fn read_timer(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.timer.as_raw_fd(), &mut buf) {
            Ok(8) => u64::from_ne_bytes(buf),
            Ok(n) => {
                warn!(id = self.id, n, "short timerfd read");
                0
            }
            Err(nix::errno::Errno::EAGAIN) => 0,
            Err(e) => {
                warn!(id = self.id, "timerfd read failed: {e}");
                0
            }
        }
    }

    /// Put the timer poll back. If the kernel refuses the submission now, the
    /// entry goes out with the next one.
    fn rearm_timer<H: EventHandler>(&mut self, handler: &mut H) {
        if let Err(e) = self.push_timer_poll(handler) {
            error!(id = self.id, "timer re-arm failed, timer is dead: {e}");
            return;
        }
        match self.ring.submit() {
            Ok(submitted) => self.unsubmitted -= submitted.min(self.unsubmitted),
            Err(e) => debug!(id = self.id, "deferring timer re-arm: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use uring_common::libc;

    use super::PollCompletion;
    use crate::ops::Target;
    use crate::system::slots::Slots;
    use crate::Readiness;

    fn completion(result: i32) -> PollCompletion {
        PollCompletion {
            slot: Slots::TIMER,
            token: 7,
            target: Target::Fd(3),
            result,
            still_armed: false,
        }
    }

    #[test]
    fn positive_result_is_readiness() {
        let c = completion((libc::POLLIN | libc::POLLHUP) as i32);
        let readiness = c.readiness().unwrap();
        assert!(readiness.contains(Readiness::READABLE | Readiness::HANGUP));
        assert!(!c.is_cancelled());
    }

    #[test]
    fn negative_result_is_errno() {
        let c = completion(-libc::ECANCELED);
        assert!(c.is_cancelled());
        assert_eq!(
            c.readiness().unwrap_err().raw_os_error(),
            Some(libc::ECANCELED)
        );
    }
}
