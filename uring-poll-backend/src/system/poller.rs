//! Driving a [`Backend`] from a tokio task.
//!
//! The ring file descriptor becomes readable when completions are pending, so
//! it can sit in tokio's epoll like any other descriptor. The [`Poller`] owns
//! the backend and its handler and alternates non-blocking submit / drain
//! with waiting for that readiness.

use std::os::fd::RawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::completion::EventHandler;
use super::lifecycle::Backend;
use super::submission::SubmitError;
use super::WaitMode;

pub struct Poller<H> {
    // declared first: deregister from epoll before the backend closes the ring
    ring_fd: AsyncFd<RawFd>,
    backend: Backend,
    handler: H,
}

impl<H: EventHandler> Poller<H> {
    /// Register the backend's ring with the current tokio runtime.
    pub fn new(backend: Backend, handler: H) -> std::io::Result<Self> {
        let ring_fd = AsyncFd::with_interest(backend.ring_fd(), Interest::READABLE)?;
        Ok(Poller {
            ring_fd,
            backend,
            handler,
        })
    }

    /// Submit what is armed and dispatch completions, waiting until there is
    /// at least one. Returns the number dispatched.
    ///
    /// Cancel safe: dropping the future loses nothing.
    pub async fn poll_once(&mut self) -> Result<usize, SubmitError> {
        loop {
            self.backend
                .submit_batch(WaitMode::DontWait, &mut self.handler)?;
            let processed = self
                .backend
                .drain(WaitMode::DontWait, &mut self.handler)?;
            if processed > 0 {
                return Ok(processed);
            }
            let mut is_timeout_wakeup = false;
            tokio::select! {
                ready_res = self.ring_fd.ready(Interest::READABLE) => {
                    let mut guard = ready_res.map_err(SubmitError::Kernel)?;
                    if !guard.ready().is_readable() {
                        trace!("spurious wakeup");
                    }
                    // cleared before the next drain, so no completion is missed
                    guard.clear_ready_matching(Ready::READABLE);
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    is_timeout_wakeup = true;
                }
            }
            if is_timeout_wakeup {
                self.backend.debug_dump();
            }
        }
    }

    /// [`Self::poll_once`] until `cancel` fires or the ring fails.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SubmitError> {
        info!("poller running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("poller cancelled");
                    return Ok(());
                }
                res = self.poll_once() => {
                    res?;
                }
            }
        }
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Stop polling. The backend keeps running; shut it down when done.
    pub fn into_parts(self) -> (Backend, H) {
        let Poller {
            ring_fd,
            backend,
            handler,
        } = self;
        drop(ring_fd);
        (backend, handler)
    }
}
