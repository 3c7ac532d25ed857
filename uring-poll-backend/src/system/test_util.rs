use std::os::fd::AsRawFd;

use crate::{
    Backend, BackendOptions, CancelCompletion, EventHandler, LaunchError, PollCompletion,
    Readiness, Watch,
};

pub(crate) mod timerfd;

/// `None` if io_uring isn't available here; the caller skips the test.
pub(crate) fn launch(options: BackendOptions) -> Option<Backend> {
    // captured per test; shown for failing tests only
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    match Backend::new(options) {
        Ok(backend) => Some(backend),
        Err(LaunchError::NotAvailable { stage, source }) => {
            eprintln!("skipping: io_uring not available ({stage}): {source}");
            None
        }
        Err(e) => panic!("unexpected launch error: {e:?}"),
    }
}

/// Records every callback.
#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) polls: Vec<PollCompletion>,
    pub(crate) cancels: Vec<CancelCompletion>,
    pub(crate) timer_expirations: u64,
}

impl Recorder {
    pub(crate) fn callbacks(&self) -> usize {
        self.polls.len() + self.cancels.len()
    }
}

impl EventHandler for Recorder {
    fn on_poll(&mut self, _backend: &mut Backend, completion: PollCompletion) {
        self.polls.push(completion);
    }

    fn on_timer(&mut self, _backend: &mut Backend, expirations: u64) {
        self.timer_expirations += expirations;
    }

    fn on_cancel(&mut self, _backend: &mut Backend, completion: CancelCompletion) {
        self.cancels.push(completion);
    }
}

pub(crate) fn pipes(n: usize) -> Vec<(os_pipe::PipeReader, os_pipe::PipeWriter)> {
    (0..n).map(|_| os_pipe::pipe().unwrap()).collect()
}

pub(crate) fn readable(reader: &os_pipe::PipeReader, token: u64) -> Watch {
    Watch::new(reader.as_raw_fd(), Readiness::READABLE).token(token)
}
