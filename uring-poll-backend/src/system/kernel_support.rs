//! Whether io_uring is usable in this process.

use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;
use tracing::info;

use crate::metrics;
use crate::options::BackendOptions;

use super::lifecycle::{Backend, LaunchError};

/// A capability probe that runs at most once and remembers its answer.
///
/// Keep one per process (or per test) and ask it before choosing io_uring
/// over another backend:
///
/// ```no_run
/// use uring_poll_backend::Capability;
///
/// static URING: Capability = Capability::new();
///
/// if URING.is_available() {
///     // construct a Backend
/// }
/// ```
pub struct Capability {
    probe: fn() -> bool,
    cached: OnceCell<bool>,
}

impl Capability {
    /// Probe by constructing and tearing down a scratch [`Backend`].
    pub const fn new() -> Self {
        Self::with_probe(probe_kernel)
    }

    /// Use `probe` instead of the kernel. For tests and for callers that
    /// already know the answer.
    pub const fn with_probe(probe: fn() -> bool) -> Self {
        Capability {
            probe,
            cached: OnceCell::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        *self.cached.get_or_init(|| {
            metrics::GLOBAL_STORAGE
                .capability_probes
                .fetch_add(1, Ordering::Relaxed);
            (self.probe)()
        })
    }

    /// The cached answer, without probing.
    pub fn cached(&self) -> Option<bool> {
        self.cached.get().copied()
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_kernel() -> bool {
    match Backend::new(BackendOptions::probe()) {
        Ok(backend) => {
            backend.shutdown();
            true
        }
        Err(LaunchError::NotAvailable { stage, source }) => {
            info!(stage, "io_uring not available: {source}");
            false
        }
        Err(LaunchError::InvalidOptions(e)) => {
            unreachable!("probe options are always valid: {e}")
        }
    }
}
