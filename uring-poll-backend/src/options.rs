/// Construction parameters of a [`crate::Backend`].
///
/// ```
/// let options = uring_poll_backend::BackendOptions::default()
///     .capacity(64)
///     .max_submit(8)
///     .use_registered_fds(true);
/// assert_eq!(options.capacity, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// Completion queue depth. Also sizes the registered descriptor table,
    /// and the slot pool holds twice this many operations.
    pub capacity: usize,
    /// Most poll-adds handed to the kernel per submission. The submission
    /// queue is twice this size, leaving room for cancellations.
    pub max_submit: usize,
    /// Most completions processed per [`crate::Backend::drain`] call.
    pub max_get: usize,
    /// Register a descriptor table with the kernel. Failure to do so is not fatal.
    pub use_registered_fds: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            capacity: 1024,
            max_submit: 128,
            max_get: usize::MAX,
            use_registered_fds: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    #[error("max_submit must be at least 1")]
    ZeroMaxSubmit,
    #[error("max_get must be at least 1")]
    ZeroMaxGet,
    #[error("capacity {capacity} is smaller than the submission queue ({sq_entries} entries)")]
    CapacityBelowSubmissionQueue { capacity: usize, sq_entries: usize },
    #[error("capacity {0} is too large")]
    CapacityTooLarge(usize),
}

/// Upper bound the kernel accepts for the completion queue.
const MAX_CQ_ENTRIES: usize = 1 << 16;

impl BackendOptions {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_submit(mut self, max_submit: usize) -> Self {
        self.max_submit = max_submit;
        self
    }

    pub fn max_get(mut self, max_get: usize) -> Self {
        self.max_get = max_get;
        self
    }

    pub fn use_registered_fds(mut self, use_registered_fds: bool) -> Self {
        self.use_registered_fds = use_registered_fds;
        self
    }

    pub(crate) fn sq_entries(&self) -> usize {
        2 * self.max_submit
    }

    pub(crate) fn total_slots(&self) -> usize {
        2 * self.capacity
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.capacity == 0 {
            return Err(OptionsError::ZeroCapacity);
        }
        if self.max_submit == 0 {
            return Err(OptionsError::ZeroMaxSubmit);
        }
        if self.max_get == 0 {
            return Err(OptionsError::ZeroMaxGet);
        }
        if self.capacity > MAX_CQ_ENTRIES {
            return Err(OptionsError::CapacityTooLarge(self.capacity));
        }
        if self.capacity < self.sq_entries() {
            return Err(OptionsError::CapacityBelowSubmissionQueue {
                capacity: self.capacity,
                sq_entries: self.sq_entries(),
            });
        }
        Ok(())
    }

    /// Small scratch configuration used to probe for kernel support.
    pub(crate) fn probe() -> Self {
        BackendOptions {
            capacity: 1024,
            max_submit: 128,
            max_get: usize::MAX,
            use_registered_fds: false,
        }
    }
}
