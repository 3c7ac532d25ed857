//! An io_uring-based readiness multiplexer for single-threaded event loops.
//!
//! The [`Backend`] turns "watch this descriptor for readiness" and "stop
//! watching" requests into poll-add / poll-remove operations on an io_uring
//! instance, and dispatches the kernel's completions to an [`EventHandler`].
//! It does no data transfer of its own: what to do once a descriptor is ready
//! is entirely up to the handler.
//!
//! # Usage
//!
//! 1. Probe once per process with [`Capability`] and construct a [`Backend`].
//! 2. [`Backend::arm`] a [`Watch`] per descriptor you're interested in.
//! 3. [`Backend::submit_batch`] hands the armed watches to the kernel.
//! 4. [`Backend::drain`] dispatches completions to your [`EventHandler`].
//! 5. [`Backend::shutdown`] tears down, blocking until the kernel is done with every slot.
//!
//! All of this happens on one thread. The [`Poller`] drives steps 3 and 4 from
//! a tokio task instead of a blocking loop.
//!
//! ```no_run
//! use std::os::fd::AsRawFd;
//! use uring_poll_backend::{
//!     Backend, BackendOptions, EventHandler, PollCompletion, Readiness, WaitMode, Watch,
//! };
//!
//! struct Print;
//!
//! impl EventHandler for Print {
//!     fn on_poll(&mut self, _backend: &mut Backend, completion: PollCompletion) {
//!         println!("token {} ready: {:?}", completion.token, completion.readiness());
//!     }
//! }
//!
//! let (reader, _writer) = os_pipe::pipe().unwrap();
//! let mut backend = Backend::new(BackendOptions::default()).unwrap();
//! backend
//!     .arm(Watch::new(reader.as_raw_fd(), Readiness::READABLE).token(1))
//!     .unwrap();
//! backend.submit_batch(WaitMode::DontWait, &mut Print).unwrap();
//! backend.drain(WaitMode::Wait, &mut Print).unwrap();
//! backend.shutdown();
//! ```

pub mod metrics;

pub mod ops;

mod options;

mod system;

pub use options::{BackendOptions, OptionsError};
pub use ops::{Target, Watch};
pub use system::completion::{CancelCompletion, EventHandler, PollCompletion};
pub use system::kernel_support::Capability;
pub use system::lifecycle::{Backend, LaunchError};
pub use system::poller::Poller;
pub use system::registry::{FdRegistry, FileTable, RegisteredFd, RegistryError, Released};
pub use system::ring::{RingFeatures, RingInfo};
pub use system::slots::SlotId;
pub use system::submission::{ArmError, CancelError, CancelOutcome, SubmitError};
pub use system::WaitMode;

pub use uring_common::Readiness;

#[doc(hidden)]
pub mod env_tunables {
    pub(crate) static DISABLE_REGISTERED_FDS: once_cell::sync::Lazy<bool> =
        once_cell::sync::Lazy::new(|| {
            std::env::var("URING_POLL_BACKEND_DISABLE_REGISTERED_FDS")
                .map(|v| v == "1")
                .unwrap_or_else(|e| match e {
                    std::env::VarError::NotPresent => false, // default-off
                    std::env::VarError::NotUnicode(_) => panic!(
                        "URING_POLL_BACKEND_DISABLE_REGISTERED_FDS must be a unicode string"
                    ),
                })
        });
    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("URING_POLL_BACKEND_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "URING_POLL_BACKEND_DISABLE_REGISTERED_FDS" => {}
                x => panic!(
                    "env var starts with URING_POLL_BACKEND_ but is not an env_tunable: {x:?}"
                ),
            });
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn env_tunables_are_known() {
        crate::env_tunables::assert_no_unknown_env_vars();
        let _ = *crate::env_tunables::DISABLE_REGISTERED_FDS;
    }
}
