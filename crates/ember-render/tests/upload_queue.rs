// SPDX-License-Identifier: CEPL-1.0
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::{desktop_caps, engine, engine_with, Call, Handle, MockBackend};
use ember_core::{Origin, Severity};
use ember_render::{
    Backend, DeferredCommand, DeferredFlags, EngineConfig, FrameEngine, RenderSize, SubmitAction,
};

fn frame(engine: &mut FrameEngine<MockBackend>) {
    engine.begin_frame().unwrap().ready().unwrap();
    engine.end_frame().unwrap();
}

fn deferred_batch(engine: &FrameEngine<MockBackend>, nth: usize) -> Vec<Handle> {
    let state = engine.backend().state.lock();
    let batch = match state.submits()[nth] {
        Call::Submit { batches, .. } => batches.get(1).cloned().unwrap_or_default(),
        other => panic!("unexpected {other:?}"),
    };
    batch
}

#[test]
fn test_deferred_buffers_ride_the_next_submit_in_order() {
    let (mut engine, _sink) = engine();
    let queue = engine.upload_queue();
    for raw in [901, 902, 903] {
        queue.push(DeferredCommand::new(Handle(raw))).unwrap();
    }
    assert_eq!(queue.len(), 3);

    frame(&mut engine);
    assert!(queue.is_empty());
    assert_eq!(
        deferred_batch(&engine, 0),
        vec![Handle(901), Handle(902), Handle(903)]
    );
    assert_eq!(engine.scratch().used(), 0, "batch copy is released");

    frame(&mut engine);
    assert!(deferred_batch(&engine, 1).is_empty());
}

#[test]
fn test_deferred_batch_has_no_semaphores() {
    let (mut engine, _sink) = engine();
    engine
        .upload_queue()
        .push(DeferredCommand::new(Handle(901)))
        .unwrap();
    frame(&mut engine);

    let state = engine.backend().state.lock();
    match state.submits()[0] {
        Call::Submit { waits, signals, .. } => {
            assert_eq!(waits.len(), 2);
            assert!(waits[0].is_some() && waits[1].is_none());
            assert!(signals[0].is_some() && signals[1].is_none());
        }
        other => panic!("unexpected {other:?}"),
    };
}

#[test]
fn test_actions_run_only_after_covering_fence() {
    let (mut engine, _sink) = engine();
    engine
        .upload_queue()
        .push(
            DeferredCommand::new(Handle(901))
                .free_after_submit()
                .on_submit(SubmitAction::ReleaseStaging(7)),
        )
        .unwrap();

    // slot 0 submits the upload, slot 1 does not touch its fence
    frame(&mut engine);
    frame(&mut engine);
    {
        let state = engine.backend().state.lock();
        assert_eq!(state.count(|c| *c == Call::ReleaseStaging(7)), 0);
        assert_eq!(state.count(|c| *c == Call::FreeOneShot(Handle(901))), 0);
    }

    engine.begin_frame().unwrap().ready().unwrap();
    let fence_0 = engine.swapchain().in_flight(0).unwrap();
    let state = engine.backend().state.lock();
    let submitted = state
        .position(|c| matches!(c, Call::Submit { batches, .. } if batches.len() == 2))
        .unwrap();
    let waited = state.calls[submitted..]
        .iter()
        .position(|c| {
            *c == Call::WaitFence {
                fence: fence_0,
                signaled: true,
            }
        })
        .map(|i| i + submitted)
        .unwrap();
    let released = state.position(|c| *c == Call::ReleaseStaging(7)).unwrap();
    let freed = state
        .position(|c| *c == Call::FreeOneShot(Handle(901)))
        .unwrap();
    assert!(waited < released && released < freed);
}

#[test]
fn test_kept_buffers_are_not_freed() {
    let (mut engine, _sink) = engine();
    engine
        .upload_queue()
        .push(DeferredCommand::new(Handle(901)))
        .unwrap();
    for _ in 0..3 {
        frame(&mut engine);
    }
    let state = engine.backend().state.lock();
    assert_eq!(state.count(|c| matches!(c, Call::FreeOneShot(_))), 0);
}

#[test]
fn test_custom_action_gets_the_backend() {
    let (mut engine, _sink) = engine();
    let action: Box<dyn FnOnce(&MockBackend) + Send> = Box::new(|backend| {
        backend.state.lock().calls.push(Call::Custom("texture ready"));
    });
    let command = DeferredCommand::new(Handle(901)).on_submit(SubmitAction::Custom(action));
    assert!(command.flags.contains(DeferredFlags::HAS_SUBMIT_ACTION));
    engine.upload_queue().push(command).unwrap();

    for _ in 0..3 {
        frame(&mut engine);
    }
    let state = engine.backend().state.lock();
    assert_eq!(state.count(|c| *c == Call::Custom("texture ready")), 1);
}

#[test]
fn test_action_runs_even_when_flag_is_missing() {
    let (mut engine, _sink) = engine();
    let command = DeferredCommand::<MockBackend> {
        command_buffer: Handle(902),
        flags: DeferredFlags::FREE_AFTER_SUBMIT,
        on_submit: Some(SubmitAction::ReleaseStaging(7)),
    };
    engine.upload_queue().push(command).unwrap();

    for _ in 0..3 {
        frame(&mut engine);
    }
    let state = engine.backend().state.lock();
    assert_eq!(state.count(|c| *c == Call::ReleaseStaging(7)), 1);
    assert_eq!(state.count(|c| *c == Call::FreeOneShot(Handle(902))), 1);
}

#[test]
fn test_rejected_push_reports_synced_flags() {
    let cfg = EngineConfig {
        upload_arena_bytes: 8,
        ..EngineConfig::default()
    };
    let (engine, _sink) = engine_with(desktop_caps(), cfg, RenderSize::new(800, 600));
    let queue = engine.upload_queue();
    queue.push(DeferredCommand::new(Handle(1))).unwrap();

    let stray = DeferredCommand::<MockBackend> {
        command_buffer: Handle(2),
        flags: DeferredFlags::HAS_SUBMIT_ACTION,
        on_submit: None,
    };
    let rejected = queue.push(stray).unwrap_err();
    assert_eq!(rejected.error.origin, Origin::ArenaOutOfMemory);
    assert!(!rejected.command.flags.contains(DeferredFlags::HAS_SUBMIT_ACTION));
}

#[test]
fn test_exhausted_arena_rejects_push_but_frame_submits() {
    let cfg = EngineConfig {
        upload_arena_bytes: 2 * std::mem::size_of::<Handle>(),
        ..EngineConfig::default()
    };
    let (mut engine, sink) = engine_with(desktop_caps(), cfg, RenderSize::new(800, 600));
    let queue = engine.upload_queue();
    queue.push(DeferredCommand::new(Handle(901))).unwrap();
    queue.push(DeferredCommand::new(Handle(902))).unwrap();

    let rejected = queue
        .push(DeferredCommand::new(Handle(903)).on_submit(SubmitAction::ReleaseStaging(3)))
        .unwrap_err();
    assert_eq!(rejected.error.origin, Origin::ArenaOutOfMemory);
    assert_eq!(rejected.error.severity, Severity::Recoverable);
    assert_eq!(rejected.command.command_buffer, Handle(903));
    assert_eq!(
        sink.origins(),
        vec![(Severity::Recoverable, Origin::ArenaOutOfMemory)]
    );
    // the producer undoes its own work
    if let Some(action) = rejected.command.on_submit {
        action.run(engine.backend());
    }

    frame(&mut engine);
    assert_eq!(deferred_batch(&engine, 0), vec![Handle(901), Handle(902)]);
    assert_eq!(queue.remaining(), 2 * std::mem::size_of::<Handle>());
    queue.push(DeferredCommand::new(Handle(904))).unwrap();
}

#[test]
fn test_full_arena_still_submits_primary_buffer() {
    let cfg = EngineConfig {
        upload_arena_bytes: 1,
        ..EngineConfig::default()
    };
    let (mut engine, _sink) = engine_with(desktop_caps(), cfg, RenderSize::new(800, 600));
    assert!(engine
        .upload_queue()
        .push(DeferredCommand::new(Handle(901)))
        .is_err());

    frame(&mut engine);
    let state = engine.backend().state.lock();
    let submits = state.submits();
    assert_eq!(submits.len(), 1);
    assert!(matches!(submits[0], Call::Submit { batches, ok: true, .. } if batches.len() == 1));
}

#[test]
fn test_producers_on_many_threads() {
    let (mut engine, _sink) = engine();
    let queue = engine.upload_queue();

    let workers: Vec<_> = (0..4u64)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..2 {
                    queue
                        .push(DeferredCommand::new(Handle(1_000 + t * 10 + i)).free_after_submit())
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    frame(&mut engine);
    let mut batch = deferred_batch(&engine, 0);
    assert_eq!(batch.len(), 8);
    batch.sort_by_key(|h| h.0);
    batch.dedup();
    assert_eq!(batch.len(), 8);
}

#[test]
fn test_failed_submit_still_retires_deferred_work() {
    let (mut engine, _sink) = engine();
    engine
        .backend()
        .state
        .lock()
        .submit_script
        .push_back(Err(ember_render::DriverError::Failed(-4)));
    engine
        .upload_queue()
        .push(DeferredCommand::new(Handle(901)).on_submit(SubmitAction::ReleaseStaging(9)))
        .unwrap();

    frame(&mut engine);
    assert_eq!(
        engine
            .backend()
            .state
            .lock()
            .count(|c| *c == Call::ReleaseStaging(9)),
        0
    );

    // the dropped frame forces a rebuild, which idles the GPU first
    frame(&mut engine);
    let state = engine.backend().state.lock();
    assert_eq!(state.count(|c| *c == Call::ReleaseStaging(9)), 1);
}

#[test]
fn test_teardown_completes_pending_work_and_closes_queue() {
    let (mut engine, _sink) = engine();
    let ran = Arc::new(AtomicUsize::new(0));
    let queue = engine.upload_queue();

    let counter = |ran: &Arc<AtomicUsize>| {
        let ran = ran.clone();
        SubmitAction::<MockBackend>::Custom(Box::new(move |_: &MockBackend| {
            ran.fetch_add(1, Ordering::SeqCst);
        }))
    };
    // one submitted but never fence-waited, one never submitted
    queue
        .push(DeferredCommand::new(Handle(901)).on_submit(counter(&ran)))
        .unwrap();
    frame(&mut engine);
    queue
        .push(DeferredCommand::new(Handle(902)).on_submit(counter(&ran)))
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let state = engine.backend().state.clone();
    drop(engine);
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(state.lock().live_objects(), 0);

    let late = queue.push(DeferredCommand::new(Handle(903))).unwrap_err();
    assert_eq!(late.error.origin, Origin::Uncategorized);
}

#[test]
fn test_release_staging_reaches_backend() {
    let backend = MockBackend::new(desktop_caps());
    SubmitAction::<MockBackend>::ReleaseStaging(5).run(&backend);
    backend.release_staging(6);
    let state = backend.state.lock();
    assert_eq!(
        state.calls,
        vec![Call::ReleaseStaging(5), Call::ReleaseStaging(6)]
    );
}
