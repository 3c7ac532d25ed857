use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timer::TimerSetTimeFlags;
use nix::sys::timerfd::Expiration;

use crate::Backend;

/// Arm the backend's timer to expire once, `after` from now.
pub(crate) fn oneshot(backend: &Backend, after: Duration) {
    backend
        .timer()
        .set(
            Expiration::OneShot(TimeSpec::from_duration(after)),
            TimerSetTimeFlags::empty(),
        )
        .unwrap();
}

pub(crate) fn interval(backend: &Backend, every: Duration) {
    backend
        .timer()
        .set(
            Expiration::Interval(TimeSpec::from_duration(every)),
            TimerSetTimeFlags::empty(),
        )
        .unwrap();
}
