use uring_common::io_uring;

use crate::system::slots::SlotId;

/// Cancellation of a submitted poll-add, identified by the poll-add's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollRemove {
    pub(crate) target: SlotId,
}

impl PollRemove {
    pub(crate) fn make_sqe(&self) -> io_uring::squeue::Entry {
        io_uring::opcode::PollRemove::new(self.target.tag()).build()
    }
}

/// A poll-remove that owns no slot. Only issued during teardown.
pub(crate) fn make_detached_sqe(target_tag: u64) -> io_uring::squeue::Entry {
    io_uring::opcode::PollRemove::new(target_tag).build()
}
