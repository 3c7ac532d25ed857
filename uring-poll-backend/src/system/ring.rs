use std::os::fd::{AsRawFd, RawFd};

use uring_common::io_uring::{self, cqueue, squeue, IoUring};

/// Ring properties fixed at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingInfo {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub sq_mask: u32,
    pub cq_mask: u32,
    pub features: RingFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFeatures {
    /// The completion queue was sized explicitly (`IORING_SETUP_CQSIZE`).
    pub cq_size_fixed: bool,
    /// The kernel never drops completions on CQ overflow.
    pub no_drop: bool,
    /// Poll-driven retry of non-blocking operations inside the kernel.
    pub fast_poll: bool,
}

/// Owner of the kernel ring pair.
///
/// `fd` is negative once the ring is closed; no ring call happens after that.
pub(crate) struct RingHandle {
    ring: Option<IoUring>,
    fd: RawFd,
    info: RingInfo,
}

impl RingHandle {
    pub(crate) fn setup(cq_entries: u32, sq_entries: u32) -> std::io::Result<RingHandle> {
        let ring = IoUring::builder()
            .setup_cqsize(cq_entries)
            .build(sq_entries)?;
        let params = ring.params();
        // the kernel rounds both rings up to a power of two; the masks it
        // publishes are always entries - 1
        let info = RingInfo {
            sq_entries: params.sq_entries(),
            cq_entries: params.cq_entries(),
            sq_mask: params.sq_entries() - 1,
            cq_mask: params.cq_entries() - 1,
            features: RingFeatures {
                cq_size_fixed: true,
                no_drop: params.is_feature_nodrop(),
                fast_poll: params.is_feature_fast_poll(),
            },
        };
        let fd = ring.as_raw_fd();
        Ok(RingHandle {
            ring: Some(ring),
            fd,
            info,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn info(&self) -> RingInfo {
        self.info
    }

    fn uring(&mut self) -> &mut IoUring {
        match self.ring.as_mut() {
            Some(ring) => ring,
            None => panic!("implementation error: ring used after close"),
        }
    }

    pub(crate) fn submitter(&self) -> io_uring::Submitter<'_> {
        match self.ring.as_ref() {
            Some(ring) => ring.submitter(),
            None => panic!("implementation error: ring used after close"),
        }
    }

    /// Queue one entry. Fails only if the submission queue is full.
    pub(crate) fn push(&mut self, sqe: &squeue::Entry) -> Result<(), squeue::PushError> {
        // SAFETY: every entry this crate builds is a poll-add or poll-remove;
        // neither references user-space memory.
        unsafe { self.uring().submission().push(sqe) }
    }

    pub(crate) fn submit(&mut self) -> std::io::Result<usize> {
        self.uring().submit()
    }

    pub(crate) fn submit_and_wait(&mut self, want: usize) -> std::io::Result<usize> {
        self.uring().submit_and_wait(want)
    }

    pub(crate) fn has_completions(&mut self) -> bool {
        !self.uring().completion().is_empty()
    }

    /// Take the next completion off the queue, marking it consumed.
    pub(crate) fn next_completion(&mut self) -> Option<cqueue::Entry> {
        self.uring().completion().next()
    }

    pub(crate) fn close(&mut self) {
        if let Some(ring) = self.ring.take() {
            drop(ring);
        }
        self.fd = -1;
    }
}
