//! Construction and teardown of a [`Backend`].

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};
use tracing::{debug, error, info};
use uring_common::io_uring::{cqueue, squeue};
use uring_common::libc;

use crate::metrics::{self, MetricsStorage};
use crate::ops::{poll_add::Target, poll_remove, timer, Watch};
use crate::options::{BackendOptions, OptionsError};

use super::completion::{Discard, EventHandler};
use super::registry::{FdRegistry, RegisteredFd, RegistryError, Released};
use super::ring::{RingHandle, RingInfo};
use super::slots::{Op, Resolved, SlotId, Slots};
use super::submission::SubmitError;

/// Construction failed.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// io_uring can't be used in this process: the kernel lacks support,
    /// a resource limit was hit, or the timer could not be set up.
    /// Cache this; retrying won't help.
    #[error("io_uring backend not available ({stage})")]
    NotAvailable {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid backend options")]
    InvalidOptions(#[from] OptionsError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerState {
    /// Cleared when the kernel rejects multishot poll.
    pub(crate) multishot: bool,
    /// The kernel holds a poll on the timerfd.
    pub(crate) in_flight: bool,
}

/// An io_uring readiness multiplexer. See the [crate-level docs](crate).
///
/// Owned and driven by a single thread. Dropping the backend tears it down
/// the same way [`Self::shutdown`] does.
pub struct Backend {
    pub(crate) id: usize,
    pub(crate) options: BackendOptions,
    pub(crate) ring: RingHandle,
    pub(crate) slots: Slots,
    pub(crate) registry: FdRegistry,
    pub(crate) timer: TimerFd,
    pub(crate) timer_state: TimerState,
    /// Entries pushed to the submission queue but not yet consumed by the kernel.
    pub(crate) unsubmitted: usize,
    pub(crate) shutting_down: bool,
    pub(crate) metrics: &'static MetricsStorage,
    #[cfg(test)]
    pub(crate) chunk_sizes: Vec<usize>,
    /// Submissions that report `EBUSY` before reaching the kernel.
    #[cfg(test)]
    pub(crate) inject_busy: usize,
}

static BACKEND_ID: AtomicUsize = AtomicUsize::new(0);

impl Backend {
    /// Set up the ring, the slot pool, the optional descriptor table and the timer, in that order.
    pub fn new(options: BackendOptions) -> Result<Backend, LaunchError> {
        Self::new_with_metrics(options, &metrics::GLOBAL_STORAGE)
    }

    pub(crate) fn new_with_metrics(
        options: BackendOptions,
        metrics: &'static MetricsStorage,
    ) -> Result<Backend, LaunchError> {
        options.validate()?;
        let id = BACKEND_ID.fetch_add(1, Ordering::Relaxed);

        let ring = RingHandle::setup(options.capacity as u32, options.sq_entries() as u32)
            .map_err(|source| {
                error!(id, capacity = options.capacity, "io_uring setup failed: {source}");
                LaunchError::NotAvailable {
                    stage: "ring setup",
                    source,
                }
            })?;

        let slots = Slots::new(options.total_slots());

        let use_registered_fds =
            options.use_registered_fds && !*crate::env_tunables::DISABLE_REGISTERED_FDS;
        let mut registry = FdRegistry::new(if use_registered_fds {
            options.capacity
        } else {
            0
        });
        if let Err(e) = registry.init(&ring.submitter()) {
            debug!(id, "continuing without registered descriptors: {e}");
        }

        // the timer is armed last: arming it may need to drain the ring, which
        // must not happen before the descriptor table is registered
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|errno| {
            error!(id, "timerfd creation failed: {errno}");
            LaunchError::NotAvailable {
                stage: "timer setup",
                source: errno.into(),
            }
        })?;

        let mut backend = Backend {
            id,
            options,
            ring,
            slots,
            registry,
            timer,
            timer_state: TimerState {
                multishot: true,
                in_flight: false,
            },
            unsubmitted: 0,
            shutting_down: false,
            metrics,
            #[cfg(test)]
            chunk_sizes: Vec::new(),
            #[cfg(test)]
            inject_busy: 0,
        };
        metrics.backends_created.fetch_add(1, Ordering::Relaxed);

        // on failure, dropping `backend` tears down what was set up so far
        backend.arm_timer().map_err(|source| {
            error!(id, "arming the timer poll failed: {source}");
            LaunchError::NotAvailable {
                stage: "timer arm",
                source,
            }
        })?;

        info!(
            id,
            capacity = options.capacity,
            max_submit = options.max_submit,
            registered_fds = backend.registry.is_enabled(),
            "backend launched"
        );
        Ok(backend)
    }

    fn arm_timer(&mut self) -> std::io::Result<()> {
        let res = self
            .push_timer_poll(&mut Discard)
            .and_then(|()| self.submit_non_blocking(&mut Discard));
        match res {
            Ok(_) => Ok(()),
            Err(SubmitError::Kernel(e)) => Err(e),
        }
    }

    pub(crate) fn push_timer_poll<H: EventHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), SubmitError> {
        let sqe = timer::make_sqe(self.timer.as_raw_fd(), self.timer_state.multishot)
            .user_data(Slots::TIMER.tag());
        self.push_sqe(&sqe, handler)?;
        self.timer_state.in_flight = true;
        Ok(())
    }

    /// Queue an entry for the next submission.
    ///
    /// Handlers that run while a full completion queue is drained may arm and
    /// submit on their own, so the submission queue can be full here. It is
    /// flushed first in that case.
    pub(crate) fn push_sqe<H: EventHandler>(
        &mut self,
        sqe: &squeue::Entry,
        handler: &mut H,
    ) -> Result<(), SubmitError> {
        while self.ring.push(sqe).is_err() {
            let submitted = self.submit_non_blocking(handler)?;
            if submitted == 0 && self.unsubmitted > 0 {
                panic!(
                    "implementation error: submission queue full, kernel took none of {} entries",
                    self.unsubmitted
                );
            }
        }
        self.unsubmitted += 1;
        Ok(())
    }

    /// The backend's timerfd. Arm it with [`TimerFd::set`]; every expiration
    /// is reported through [`crate::EventHandler::on_timer`].
    pub fn timer(&self) -> &TimerFd {
        &self.timer
    }

    pub fn ring_info(&self) -> RingInfo {
        self.ring.info()
    }

    /// The io_uring file descriptor. Readable while completions are pending.
    pub fn ring_fd(&self) -> RawFd {
        self.ring.raw_fd()
    }

    pub fn fd_registry(&self) -> &FdRegistry {
        &self.registry
    }

    /// Slots held by armed, submitted or cancelling operations.
    pub fn in_use_slots(&self) -> usize {
        self.slots.in_use()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.free_len()
    }

    /// Armed watches waiting for [`Self::submit_batch`].
    pub fn submit_list_len(&self) -> usize {
        self.slots.submit_len()
    }

    /// Submitted watches waiting for a completion.
    pub fn active_len(&self) -> usize {
        self.slots.active_len()
    }

    /// Bind `fd` to a free index of the registered descriptor table.
    ///
    /// On error keep using the raw descriptor.
    pub fn register_fd(&mut self, fd: RawFd) -> Result<RegisteredFd, RegistryError> {
        self.registry.allocate(&self.ring.submitter(), fd)
    }

    pub fn retain_fd(&mut self, fd: &RegisteredFd) -> RegisteredFd {
        self.registry.retain(fd.index())
    }

    pub fn release_fd(&mut self, fd: RegisteredFd) -> Released {
        self.registry.release(&self.ring.submitter(), fd)
    }

    /// Return a slot to the pool, dropping the registration reference its watch held.
    pub(crate) fn release_slot(&mut self, id: SlotId) {
        if let Op::PollAdd(Watch {
            target: Target::Registered(index),
            ..
        }) = self.slots.release(id)
        {
            self.registry.release_index(&self.ring.submitter(), index);
        }
    }

    pub(crate) fn debug_dump(&self) {
        let dump = self.slots.debug_dump();
        debug!(
            id = self.id,
            ?dump,
            unsubmitted = self.unsubmitted,
            timer_in_flight = self.timer_state.in_flight,
            "slots"
        );
    }

    /// Tear down, blocking until the kernel no longer references any slot.
    ///
    /// Armed watches are dropped, submitted ones are cancelled. No
    /// [`crate::EventHandler`] callback runs.
    pub fn shutdown(mut self) {
        self.cleanup();
    }

    pub(crate) fn cleanup(&mut self) {
        if !self.ring.is_open() {
            return;
        }
        let id = self.id;
        info!(id, "backend teardown start");
        scopeguard::defer_on_success! {info!(id, "backend teardown end")};
        scopeguard::defer_on_unwind! {error!(id, "backend teardown panic")};

        self.shutting_down = true;

        // never handed to the kernel
        while let Some(slot) = self.slots.pop_submit() {
            self.release_slot(slot);
        }

        // the kernel is done with these: a handler unwound before they were released
        for slot in self.slots.completing() {
            debug!(id, ?slot, "releasing slot abandoned mid-dispatch");
            self.release_slot(slot);
        }

        // submitted: have the kernel complete them now
        let mut cancels = 0;
        let mut cancelled_all = true;
        while let Some(slot) = self.slots.pop_active() {
            if !self.push_teardown_sqe(&poll_remove::make_detached_sqe(slot.tag())) {
                cancelled_all = false;
                break;
            }
            cancels += 1;
        }
        if cancelled_all && self.timer_state.in_flight {
            cancelled_all =
                self.push_teardown_sqe(&poll_remove::make_detached_sqe(Slots::TIMER.tag()));
            cancels += 1;
        }
        debug!(id, cancels, in_use = self.slots.in_use(), "cancelled in-flight operations");

        if cancelled_all {
            self.reap_until_idle();
        } else {
            // waiting would block on polls that were never cancelled
            error!(
                id,
                in_use = self.slots.in_use(),
                "teardown submission failed, abandoning slots"
            );
        }

        self.ring.close();
        self.metrics.backends_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Like [`Self::push_sqe`], but reaps instead of dispatching. `false` if
    /// the kernel refused the submission.
    fn push_teardown_sqe(&mut self, sqe: &squeue::Entry) -> bool {
        let sqe = sqe.clone().user_data(super::slots::DETACHED_TAG);
        loop {
            if self.ring.push(&sqe).is_ok() {
                self.unsubmitted += 1;
                return true;
            }
            match self.ring.submit() {
                Ok(n) => self.unsubmitted -= n.min(self.unsubmitted),
                Err(e) if is_retryable(&e) => {
                    // completions are reaped in `reap_until_idle`; pull them off here to make room
                    while let Some(cqe) = self.ring.next_completion() {
                        self.reap(cqe);
                    }
                }
                Err(e) => {
                    error!(id = self.id, "teardown submission failed: {e}");
                    return false;
                }
            }
        }
    }

    fn reap_until_idle(&mut self) {
        while self.slots.in_use() > 0 || self.timer_state.in_flight || self.unsubmitted > 0 {
            debug!(
                id = self.id,
                in_use = self.slots.in_use(),
                timer_in_flight = self.timer_state.in_flight,
                "waiting for the kernel to release slots"
            );
            match self.ring.submit_and_wait(1) {
                Ok(n) => self.unsubmitted -= n.min(self.unsubmitted),
                Err(e) if is_retryable(&e) => {}
                Err(e) => {
                    error!(
                        id = self.id,
                        in_use = self.slots.in_use(),
                        "teardown wait failed, abandoning slots: {e}"
                    );
                    return;
                }
            }
            while let Some(cqe) = self.ring.next_completion() {
                self.reap(cqe);
            }
        }
    }

    /// Teardown's completion handling: account, release, never call back.
    fn reap(&mut self, cqe: cqueue::Entry) {
        let more = cqueue::more(cqe.flags());
        match self.slots.resolve(cqe.user_data()) {
            Resolved::Detached | Resolved::Stale(_) => {}
            Resolved::Live(slot) if slot == Slots::TIMER => {
                if !more {
                    self.timer_state.in_flight = false;
                }
            }
            Resolved::Live(slot) => {
                if !more {
                    self.release_slot(slot);
                }
            }
        }
    }
}

/// `EINTR` and `EBUSY` from `io_uring_enter` mean: try again.
pub(crate) fn is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN)
    )
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cleanup();
    }
}
