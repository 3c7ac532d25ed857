pub mod readiness;

pub use readiness::Readiness;

#[cfg(target_os = "linux")]
pub use io_uring;
pub use libc;
