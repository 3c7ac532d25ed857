use std::os::fd::RawFd;

use uring_common::{io_uring, Readiness};

use crate::system::registry::RegisteredFd;

/// What a poll-add operation polls: a raw descriptor or an index into the
/// backend's registered descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Fd(RawFd),
    Registered(u32),
}

/// A readiness watch on one descriptor.
///
/// Build one with [`Watch::new`] or [`Watch::registered`], then hand it to
/// [`crate::Backend::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    pub(crate) target: Target,
    pub(crate) readiness: Readiness,
    pub(crate) persistent: bool,
    pub(crate) token: u64,
}

impl Watch {
    /// One-shot watch on a raw descriptor.
    ///
    /// The caller must keep `fd` open until the watch completes or its
    /// cancellation completes.
    pub fn new(fd: RawFd, readiness: Readiness) -> Self {
        Watch {
            target: Target::Fd(fd),
            readiness,
            persistent: false,
            token: 0,
        }
    }

    /// One-shot watch on a descriptor registered with the backend.
    ///
    /// Arming the watch takes its own reference on the registration, so the
    /// caller may release `fd` while the watch is still pending.
    pub fn registered(fd: &RegisteredFd, readiness: Readiness) -> Self {
        Watch {
            target: Target::Registered(fd.index()),
            readiness,
            persistent: false,
            token: 0,
        }
    }

    /// Keep the watch armed across completions (multishot poll).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Caller-chosen value handed back in every completion of this watch.
    pub fn token(mut self, token: u64) -> Self {
        self.token = token;
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn make_sqe(&self) -> io_uring::squeue::Entry {
        let flags = self.readiness.to_poll_flags();
        match self.target {
            Target::Fd(fd) => io_uring::opcode::PollAdd::new(io_uring::types::Fd(fd), flags)
                .multi(self.persistent)
                .build(),
            Target::Registered(index) => {
                io_uring::opcode::PollAdd::new(io_uring::types::Fixed(index), flags)
                    .multi(self.persistent)
                    .build()
            }
        }
    }
}
