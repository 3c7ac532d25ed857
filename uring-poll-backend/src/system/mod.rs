pub(super) mod completion;
pub(super) mod kernel_support;
pub(super) mod lifecycle;
pub(super) mod poller;
pub(crate) mod registry;
pub(super) mod ring;
pub(crate) mod slots;
pub(super) mod submission;
#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;

/// Whether a call may block until at least one completion is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Wait,
    DontWait,
}
