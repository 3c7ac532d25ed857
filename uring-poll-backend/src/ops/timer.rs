use std::os::fd::RawFd;

use uring_common::{io_uring, Readiness};

/// The recurring poll on the backend's timerfd. Lives in slot 0 forever.
pub(crate) fn make_sqe(timer_fd: RawFd, multishot: bool) -> io_uring::squeue::Entry {
    io_uring::opcode::PollAdd::new(
        io_uring::types::Fd(timer_fd),
        Readiness::READABLE.to_poll_flags(),
    )
    .multi(multishot)
    .build()
}
