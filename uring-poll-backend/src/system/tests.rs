use std::{
    io::Write,
    os::fd::{AsRawFd, RawFd},
    panic::AssertUnwindSafe,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use uring_common::libc;

use crate::{
    metrics::MetricsStorage,
    ops::Target,
    system::test_util::{launch, pipes, readable, timerfd, Recorder},
    ArmError, Backend, BackendOptions, CancelError, CancelOutcome, Capability, EventHandler,
    LaunchError, OptionsError, PollCompletion, Poller, Readiness, Released, SlotId, WaitMode,
    Watch,
};

#[test]
fn invalid_options_are_not_unavailability() {
    assert!(matches!(
        Backend::new(BackendOptions::default().capacity(0)),
        Err(LaunchError::InvalidOptions(OptionsError::ZeroCapacity))
    ));
}

#[test]
fn one_ready_descriptor_out_of_four() {
    let mut pipes = pipes(4);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let info = backend.ring_info();
    assert!(info.cq_entries >= 16);
    assert_eq!(info.sq_mask, info.sq_entries - 1);
    let mut recorder = Recorder::default();
    for (i, (reader, _)) in pipes.iter().enumerate() {
        backend.arm(readable(reader, i as u64)).unwrap();
    }
    assert_eq!(backend.submit_list_len(), 4);

    // ready before submission, so the waiting submit has something to wait for
    pipes[2].1.write_all(b"x").unwrap();
    assert_eq!(
        backend.submit_batch(WaitMode::Wait, &mut recorder).unwrap(),
        4
    );
    assert_eq!(backend.submit_list_len(), 0);

    assert_eq!(backend.drain(WaitMode::Wait, &mut recorder).unwrap(), 1);
    assert_eq!(recorder.polls.len(), 1);
    let completion = recorder.polls[0];
    assert_eq!(completion.token, 2);
    assert_eq!(completion.target, Target::Fd(pipes[2].0.as_raw_fd()));
    assert!(completion.readiness().unwrap().is_readable());
    assert!(!completion.still_armed);
    assert_eq!(backend.in_use_slots(), 3);
    assert_eq!(backend.active_len(), 3);

    assert_eq!(backend.drain(WaitMode::DontWait, &mut recorder).unwrap(), 0);
    backend.shutdown();
    assert_eq!(recorder.polls.len(), 1, "teardown never calls back");
}

#[test]
fn submission_is_chunked_by_max_submit() {
    let pipes = pipes(5);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(2)) else {
        return;
    };
    for (i, (reader, _)) in pipes.iter().enumerate() {
        backend.arm(readable(reader, i as u64)).unwrap();
    }
    let submitted = backend
        .submit_batch(WaitMode::DontWait, &mut Recorder::default())
        .unwrap();
    assert_eq!(submitted, 5);
    assert_eq!(backend.chunk_sizes, vec![2, 2, 1]);
    assert_eq!(backend.active_len(), 5);
    backend.shutdown();
}

#[test]
fn empty_submit_list_does_not_block() {
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let submitted = backend
        .submit_batch(WaitMode::Wait, &mut Recorder::default())
        .unwrap();
    assert_eq!(submitted, 0);
    assert!(backend.chunk_sizes.is_empty());
}

#[test]
fn cancel_submitted_watch() {
    let pipes = pipes(1);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    let watch = backend.arm(readable(&pipes[0].0, 1)).unwrap();
    backend
        .submit_batch(WaitMode::DontWait, &mut recorder)
        .unwrap();

    let CancelOutcome::Issued(remove) = backend.cancel(watch, &mut recorder).unwrap() else {
        panic!("submitted watch must be cancelled through the kernel");
    };
    assert_ne!(remove, watch);
    while recorder.callbacks() < 2 {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    assert_eq!(recorder.polls.len(), 1);
    assert_eq!(recorder.cancels.len(), 1);
    assert_eq!(recorder.polls[0].slot, watch);
    assert!(recorder.polls[0].is_cancelled());
    assert_eq!(recorder.cancels[0].slot, remove);
    assert_eq!(recorder.cancels[0].target, watch);
    assert_eq!(recorder.cancels[0].result, 0);
    assert_eq!(backend.in_use_slots(), 0);

    assert!(matches!(
        backend.cancel(watch, &mut recorder),
        Err(CancelError::NotInFlight(slot)) if slot == watch
    ));
    backend.shutdown();
}

#[test]
fn cancel_before_submission_disarms() {
    let pipes = pipes(1);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    let watch = backend.arm(readable(&pipes[0].0, 1)).unwrap();
    assert_eq!(
        backend.cancel(watch, &mut recorder).unwrap(),
        CancelOutcome::Disarmed
    );
    assert_eq!(backend.in_use_slots(), 0);
    assert_eq!(backend.submit_list_len(), 0);
    assert_eq!(
        backend
            .submit_batch(WaitMode::DontWait, &mut recorder)
            .unwrap(),
        0
    );
    assert_eq!(backend.drain(WaitMode::DontWait, &mut recorder).unwrap(), 0);
    assert_eq!(recorder.callbacks(), 0);
    backend.shutdown();
}

#[test]
fn slot_exhaustion_is_reported_per_call() {
    let pipes = pipes(3);
    // capacity 2 gives 4 slots: the timer and 3 operations
    let Some(mut backend) = launch(BackendOptions::default().capacity(2).max_submit(1)) else {
        return;
    };
    let mut recorder = Recorder::default();
    let mut watches = Vec::new();
    for (i, (reader, _)) in pipes.iter().enumerate() {
        watches.push(backend.arm(readable(reader, i as u64)).unwrap());
    }
    assert!(matches!(
        backend.arm(readable(&pipes[0].0, 9)),
        Err(ArmError::NoCapacity)
    ));
    backend
        .submit_batch(WaitMode::DontWait, &mut recorder)
        .unwrap();
    assert!(matches!(
        backend.cancel(watches[0], &mut recorder),
        Err(CancelError::NoCapacity)
    ));
    assert_eq!(backend.in_use_slots(), 3);
    backend.shutdown();
}

#[test]
fn teardown_waits_for_active_slots() {
    let pipes = pipes(2);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    for (i, (reader, _)) in pipes.iter().enumerate() {
        backend.arm(readable(reader, i as u64)).unwrap();
    }
    backend
        .submit_batch(WaitMode::DontWait, &mut recorder)
        .unwrap();
    // one more that never reaches the kernel
    backend.arm(readable(&pipes[0].0, 3)).unwrap();
    assert_eq!(backend.active_len(), 2);
    assert_eq!(backend.in_use_slots(), 3);

    backend.cleanup();
    assert_eq!(backend.in_use_slots(), 0);
    assert_eq!(backend.free_slots(), 31);
    assert!(!backend.ring.is_open());
    assert!(!backend.timer_state.in_flight);
    assert_eq!(recorder.callbacks(), 0);
    // idempotent
    backend.cleanup();
    drop(backend);
}

#[test]
fn backends_are_counted() {
    let metrics: &'static MetricsStorage = Box::leak(Box::new(MetricsStorage::new_const()));
    let backend = match Backend::new_with_metrics(
        BackendOptions::default().capacity(16).max_submit(4),
        metrics,
    ) {
        Ok(backend) => backend,
        Err(LaunchError::NotAvailable { .. }) => return,
        Err(e) => panic!("{e:?}"),
    };
    let load = |c: &std::sync::atomic::AtomicU64| c.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(load(&metrics.backends_created), 1);
    assert_eq!(load(&metrics.backends_destroyed), 0);
    backend.shutdown();
    assert_eq!(load(&metrics.backends_created), 1);
    assert_eq!(load(&metrics.backends_destroyed), 1);
}

#[test]
fn registered_descriptors() {
    let mut pipes = pipes(2);
    let Some(mut backend) = launch(
        BackendOptions::default()
            .capacity(8)
            .max_submit(4)
            .use_registered_fds(true),
    ) else {
        return;
    };
    if !backend.fd_registry().is_enabled() {
        eprintln!("skipping: descriptor registration unavailable");
        return;
    }
    let a = backend.register_fd(pipes[0].0.as_raw_fd()).unwrap();
    let b = backend.register_fd(pipes[1].0.as_raw_fd()).unwrap();
    assert_ne!(a.index(), b.index());
    let a_index = a.index();

    assert_eq!(
        backend.release_fd(a),
        Released::Unregistered {
            kernel_cleared: true
        }
    );
    assert_eq!(backend.fd_registry().ref_count(a_index), 0);
    let c = backend.register_fd(pipes[0].0.as_raw_fd()).unwrap();
    assert_eq!(c.index(), a_index);

    // the armed watch holds its own reference
    let mut recorder = Recorder::default();
    let slot = backend
        .arm(Watch::registered(&b, Readiness::READABLE).token(5))
        .unwrap();
    assert_eq!(backend.fd_registry().ref_count(b.index()), 2);
    let b_index = b.index();
    assert_eq!(
        backend.release_fd(b),
        Released::StillReferenced { count: 1 }
    );

    pipes[1].1.write_all(b"x").unwrap();
    backend.submit_batch(WaitMode::Wait, &mut recorder).unwrap();
    while recorder.polls.is_empty() {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    assert_eq!(recorder.polls[0].slot, slot);
    assert_eq!(recorder.polls[0].target, Target::Registered(b_index));
    assert!(recorder.polls[0].readiness().unwrap().is_readable());
    assert_eq!(backend.fd_registry().ref_count(b_index), 0);

    assert!(matches!(
        backend.arm(Watch::registered(&c, Readiness::READABLE)),
        Ok(_)
    ));
    backend.release_fd(c);
    backend.shutdown();
}

#[test]
fn arming_unbound_registered_index_fails() {
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let watch = Watch {
        target: Target::Registered(5),
        ..Watch::new(0, Readiness::READABLE)
    };
    assert!(matches!(backend.arm(watch), Err(ArmError::NotRegistered(5))));
    assert_eq!(backend.in_use_slots(), 0);
}

#[test]
fn persistent_watch_stays_armed() {
    let mut pipes = pipes(1);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    let slot = backend
        .arm(readable(&pipes[0].0, 1).persistent(true))
        .unwrap();
    pipes[0].1.write_all(b"x").unwrap();
    backend.submit_batch(WaitMode::Wait, &mut recorder).unwrap();
    while recorder.polls.is_empty() {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    if recorder.polls[0].result == -libc::EINVAL {
        eprintln!("skipping: multishot poll unsupported");
        return;
    }
    assert!(recorder.polls[0].still_armed);
    assert_eq!(backend.in_use_slots(), 1);

    let CancelOutcome::Issued(_) = backend.cancel(slot, &mut recorder).unwrap() else {
        panic!("persistent watch was submitted");
    };
    while recorder.cancels.is_empty() || recorder.polls.last().is_some_and(|p| p.still_armed) {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    let last = recorder.polls.last().unwrap();
    assert!(last.is_cancelled());
    assert!(!last.still_armed);
    assert_eq!(backend.in_use_slots(), 0);
    backend.shutdown();
}

#[test]
fn timer_expirations_are_reported() {
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    timerfd::oneshot(&backend, Duration::from_millis(1));
    while recorder.timer_expirations == 0 {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    assert_eq!(recorder.timer_expirations, 1);

    // the timer poll is back in place for the next expiration
    timerfd::interval(&backend, Duration::from_millis(1));
    while recorder.timer_expirations < 3 {
        backend.drain(WaitMode::Wait, &mut recorder).unwrap();
    }
    assert_eq!(recorder.callbacks(), 0);
    backend.shutdown();
}

#[test]
fn capability_after_teardown_still_succeeds() {
    let Some(backend) = launch(BackendOptions::default()) else {
        return;
    };
    backend.shutdown();
    let capability = Capability::new();
    assert!(capability.is_available());
    assert_eq!(capability.cached(), Some(true));
    assert!(capability.is_available());
}

#[tokio::test]
async fn poller_dispatches_readiness() {
    let (reader, mut writer) = os_pipe::pipe().unwrap();
    let Some(backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut poller = Poller::new(backend, Recorder::default()).unwrap();
    poller.backend_mut().arm(readable(&reader, 9)).unwrap();

    let writer_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.write_all(b"x").unwrap();
        writer
    });
    let processed = tokio::time::timeout(Duration::from_secs(10), poller.poll_once())
        .await
        .expect("ring readiness must wake the poller")
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(poller.handler_mut().polls[0].token, 9);
    let _writer = writer_task.await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    poller.run(cancel).await.unwrap();

    let (backend, recorder) = poller.into_parts();
    backend.shutdown();
    assert_eq!(recorder.polls.len(), 1);
}

struct PanicOnPoll;

impl EventHandler for PanicOnPoll {
    fn on_poll(&mut self, _backend: &mut Backend, _completion: PollCompletion) {
        panic!("handler failed");
    }
}

#[test]
fn teardown_after_handler_panic() {
    let mut pipes = pipes(2);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    backend.arm(readable(&pipes[0].0, 0)).unwrap();
    backend.arm(readable(&pipes[1].0, 1)).unwrap();
    pipes[0].1.write_all(b"x").unwrap();
    backend
        .submit_batch(WaitMode::Wait, &mut Recorder::default())
        .unwrap();

    let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
        backend.drain(WaitMode::Wait, &mut PanicOnPoll)
    }));
    assert!(res.is_err());
    // the dispatched slot was never released, the other is still with the kernel
    assert_eq!(backend.in_use_slots(), 2);
    assert_eq!(backend.active_len(), 1);

    backend.cleanup();
    assert_eq!(backend.in_use_slots(), 0);
    assert!(!backend.ring.is_open());
}

#[test]
fn backend_dropped_while_handler_unwinds() {
    let mut pipes = pipes(1);
    let metrics: &'static MetricsStorage = Box::leak(Box::new(MetricsStorage::new_const()));
    let mut backend = match Backend::new_with_metrics(
        BackendOptions::default().capacity(16).max_submit(4),
        metrics,
    ) {
        Ok(backend) => backend,
        Err(LaunchError::NotAvailable { .. }) => return,
        Err(e) => panic!("{e:?}"),
    };
    backend.arm(readable(&pipes[0].0, 0)).unwrap();
    pipes[0].1.write_all(b"x").unwrap();
    backend
        .submit_batch(WaitMode::Wait, &mut Recorder::default())
        .unwrap();

    let res = std::panic::catch_unwind(AssertUnwindSafe(move || {
        let mut backend = backend;
        backend.drain(WaitMode::Wait, &mut PanicOnPoll)
    }));
    assert!(res.is_err());
    assert_eq!(
        metrics
            .backends_destroyed
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn busy_submission_drains_then_retries() {
    let mut pipes = pipes(3);
    let Some(mut backend) = launch(BackendOptions::default().capacity(16).max_submit(4)) else {
        return;
    };
    let mut recorder = Recorder::default();
    backend.arm(readable(&pipes[0].0, 0)).unwrap();
    pipes[0].1.write_all(b"x").unwrap();
    assert_eq!(
        backend.submit_batch(WaitMode::Wait, &mut recorder).unwrap(),
        1
    );
    assert!(recorder.polls.is_empty());

    backend.arm(readable(&pipes[1].0, 1)).unwrap();
    backend.arm(readable(&pipes[2].0, 2)).unwrap();
    backend.inject_busy = 1;
    assert_eq!(
        backend
            .submit_batch(WaitMode::DontWait, &mut recorder)
            .unwrap(),
        2
    );
    assert_eq!(backend.inject_busy, 0);
    // the pending completion was dispatched to make room
    assert_eq!(recorder.polls.len(), 1);
    assert_eq!(recorder.polls[0].token, 0);
    assert_eq!(backend.chunk_sizes, vec![1, 2]);
    assert_eq!(backend.active_len(), 2);
    assert_eq!(backend.in_use_slots(), 2);
    backend.shutdown();
}

/// Arms and submits up to two more watches from every poll completion.
struct ArmFromHandler {
    idle: Vec<RawFd>,
    polls: usize,
}

impl EventHandler for ArmFromHandler {
    fn on_poll(&mut self, backend: &mut Backend, _completion: PollCompletion) {
        self.polls += 1;
        for _ in 0..2 {
            if let Some(fd) = self.idle.pop() {
                backend.arm(Watch::new(fd, Readiness::READABLE)).unwrap();
            }
        }
        backend.submit_batch(WaitMode::DontWait, self).unwrap();
    }
}

#[test]
fn handlers_submitting_during_busy_drain_do_not_overflow() {
    let mut pipes = pipes(8);
    // submission queue of 4 entries
    let Some(mut backend) = launch(BackendOptions::default().capacity(8).max_submit(2)) else {
        return;
    };
    for (i, (reader, writer)) in pipes.iter_mut().enumerate().take(2) {
        backend.arm(readable(reader, i as u64)).unwrap();
        writer.write_all(b"x").unwrap();
    }
    backend
        .submit_batch(WaitMode::Wait, &mut Recorder::default())
        .unwrap();
    backend.arm(readable(&pipes[2].0, 2)).unwrap();
    backend.arm(readable(&pipes[3].0, 3)).unwrap();

    let mut handler = ArmFromHandler {
        idle: pipes[4..].iter().map(|(r, _)| r.as_raw_fd()).collect(),
        polls: 0,
    };
    // the outer chunk and the first nested chunk both hit a busy ring, so the
    // second nested chunk finds the submission queue full
    backend.inject_busy = 2;
    assert_eq!(
        backend
            .submit_batch(WaitMode::DontWait, &mut handler)
            .unwrap(),
        2
    );
    assert_eq!(handler.polls, 2);
    assert!(handler.idle.is_empty());
    assert_eq!(backend.submit_list_len(), 0);
    assert_eq!(backend.active_len(), 6);
    assert_eq!(backend.in_use_slots(), 6);
    assert_eq!(backend.unsubmitted, 0);
    backend.shutdown();
}

/// Cancels `target` from the first poll completion.
struct DisarmFromHandler {
    target: Option<SlotId>,
    outcomes: Vec<CancelOutcome>,
}

impl EventHandler for DisarmFromHandler {
    fn on_poll(&mut self, backend: &mut Backend, _completion: PollCompletion) {
        if let Some(target) = self.target.take() {
            let outcome = backend.cancel(target, self).unwrap();
            self.outcomes.push(outcome);
        }
    }
}

#[test]
fn watch_disarmed_during_busy_drain_is_not_counted() {
    let mut pipes = pipes(4);
    let Some(mut backend) = launch(BackendOptions::default().capacity(8).max_submit(2)) else {
        return;
    };
    backend.arm(readable(&pipes[0].0, 0)).unwrap();
    pipes[0].1.write_all(b"x").unwrap();
    backend
        .submit_batch(WaitMode::Wait, &mut Recorder::default())
        .unwrap();

    backend.arm(readable(&pipes[1].0, 1)).unwrap();
    // completes as soon as it is submitted, so the waiting submit returns
    backend.arm(readable(&pipes[2].0, 2)).unwrap();
    pipes[2].1.write_all(b"x").unwrap();
    let last = backend.arm(readable(&pipes[3].0, 3)).unwrap();

    let mut handler = DisarmFromHandler {
        target: Some(last),
        outcomes: Vec::new(),
    };
    backend.inject_busy = 1;
    assert_eq!(
        backend.submit_batch(WaitMode::Wait, &mut handler).unwrap(),
        2
    );
    assert_eq!(handler.outcomes, vec![CancelOutcome::Disarmed]);
    assert_eq!(backend.submit_list_len(), 0);
    assert_eq!(backend.chunk_sizes, vec![1, 2]);
    assert!(backend.ring.has_completions());
    backend.shutdown();
}
