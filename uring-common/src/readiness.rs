//! Readiness masks and their kernel poll-flag encoding.
//!
//! A [`Readiness`] is what callers ask to be notified about when arming a watch,
//! and what the kernel reports back in a poll completion.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of readiness conditions on a file descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    /// Data is available to read (`POLLIN`).
    pub const READABLE: Readiness = Readiness(1 << 0);
    /// Writing will not block (`POLLOUT`).
    pub const WRITABLE: Readiness = Readiness(1 << 1);
    /// Urgent / out-of-band data (`POLLPRI`).
    pub const PRIORITY: Readiness = Readiness(1 << 2);
    /// Peer closed its writing half (`POLLRDHUP`).
    pub const READ_CLOSED: Readiness = Readiness(1 << 3);
    /// Hang up (`POLLHUP`). Only ever reported, never requested.
    pub const HANGUP: Readiness = Readiness(1 << 4);
    /// Error condition (`POLLERR`). Only ever reported, never requested.
    pub const ERROR: Readiness = Readiness(1 << 5);

    const TABLE: [(Readiness, libc::c_short, &'static str); 6] = [
        (Readiness::READABLE, libc::POLLIN, "READABLE"),
        (Readiness::WRITABLE, libc::POLLOUT, "WRITABLE"),
        (Readiness::PRIORITY, libc::POLLPRI, "PRIORITY"),
        (Readiness::READ_CLOSED, libc::POLLRDHUP, "READ_CLOSED"),
        (Readiness::HANGUP, libc::POLLHUP, "HANGUP"),
        (Readiness::ERROR, libc::POLLERR, "ERROR"),
    ];

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Readiness::READABLE | Readiness::READ_CLOSED | Readiness::HANGUP)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Readiness::WRITABLE)
    }

    /// Translate into the `poll32_events` value of a poll-add submission.
    pub fn to_poll_flags(self) -> u32 {
        Self::TABLE
            .iter()
            .filter(|(r, _, _)| self.contains(*r))
            .fold(0u32, |acc, (_, flag, _)| acc | (*flag as u16 as u32))
    }

    /// Decode the positive result of a poll completion.
    ///
    /// Bits that have no [`Readiness`] counterpart are dropped.
    pub fn from_poll_flags(flags: u32) -> Readiness {
        Self::TABLE
            .iter()
            .filter(|(_, flag, _)| flags & (*flag as u16 as u32) != 0)
            .fold(Readiness::EMPTY, |acc, (r, _, _)| acc | *r)
    }
}

impl BitOr for Readiness {
    type Output = Readiness;
    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Readiness;
    fn bitand(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 & rhs.0)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Readiness(EMPTY)");
        }
        write!(f, "Readiness(")?;
        let mut first = true;
        for (r, _, name) in Self::TABLE.iter() {
            if self.contains(*r) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}
