// SPDX-License-Identifier: CEPL-1.0
//! Deferred command queue, drained into the next frame submission.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use ember_core::{Arena, EngineError, ErrorSink, Origin, Severity, Span};
use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::Backend;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeferredFlags: u32 {
        /// Free the command buffer once its submission has completed.
        const FREE_AFTER_SUBMIT = 1 << 0;
        /// Mirrors `on_submit.is_some()`; the queue keeps the two in sync.
        const HAS_SUBMIT_ACTION = 1 << 1;
    }
}

pub enum SubmitAction<B: Backend> {
    /// Destroys a host-visible staging resource.
    ReleaseStaging(B::Staging),
    Custom(Box<dyn FnOnce(&B) + Send>),
}

impl<B: Backend> SubmitAction<B> {
    pub fn run(self, backend: &B) {
        match self {
            SubmitAction::ReleaseStaging(staging) => backend.release_staging(staging),
            SubmitAction::Custom(action) => action(backend),
        }
    }
}

impl<B: Backend> fmt::Debug for SubmitAction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitAction::ReleaseStaging(_) => f.write_str("ReleaseStaging"),
            SubmitAction::Custom(_) => f.write_str("Custom"),
        }
    }
}

pub struct DeferredCommand<B: Backend> {
    pub command_buffer: B::CommandBuffer,
    pub flags: DeferredFlags,
    pub on_submit: Option<SubmitAction<B>>,
}

impl<B: Backend> DeferredCommand<B> {
    /// A buffer the producer keeps ownership of.
    pub fn new(command_buffer: B::CommandBuffer) -> Self {
        Self {
            command_buffer,
            flags: DeferredFlags::empty(),
            on_submit: None,
        }
    }

    pub fn free_after_submit(mut self) -> Self {
        self.flags |= DeferredFlags::FREE_AFTER_SUBMIT;
        self
    }

    pub fn on_submit(mut self, action: SubmitAction<B>) -> Self {
        self.flags |= DeferredFlags::HAS_SUBMIT_ACTION;
        self.on_submit = Some(action);
        self
    }

    fn sync_flags(&mut self) {
        self.flags
            .set(DeferredFlags::HAS_SUBMIT_ACTION, self.on_submit.is_some());
    }

    fn retire(self) -> Retired<B> {
        Retired {
            free: self
                .flags
                .contains(DeferredFlags::FREE_AFTER_SUBMIT)
                .then_some(self.command_buffer),
            action: self.on_submit,
        }
    }
}

impl<B: Backend> fmt::Debug for DeferredCommand<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCommand")
            .field("command_buffer", &self.command_buffer)
            .field("flags", &self.flags)
            .field("on_submit", &self.on_submit)
            .finish()
    }
}

/// Work left over from a submitted command, run once its fence signalled.
pub(crate) struct Retired<B: Backend> {
    free: Option<B::CommandBuffer>,
    action: Option<SubmitAction<B>>,
}

impl<B: Backend> Retired<B> {
    pub(crate) fn complete(self, backend: &B) {
        if let Some(action) = self.action {
            action.run(backend);
        }
        if let Some(buffer) = self.free {
            backend.free_one_shot(buffer);
        }
    }
}

/// A rejected push. The command is handed back so the producer can undo
/// its own work.
#[derive(Error)]
#[error("{error}")]
pub struct PushError<B: Backend> {
    pub error: EngineError,
    pub command: DeferredCommand<B>,
}

impl<B: Backend> fmt::Debug for PushError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("error", &self.error)
            .field("command", &self.command)
            .finish()
    }
}

struct Pending<B: Backend> {
    arena: Arena,
    /// One arena allocation per push; they are adjacent and joined.
    buffers: Span<B::CommandBuffer>,
    entries: Vec<DeferredCommand<B>>,
    closed: bool,
}

pub struct UploadQueue<B: Backend> {
    pending: Mutex<Pending<B>>,
    sink: Arc<dyn ErrorSink>,
}

impl<B: Backend> UploadQueue<B> {
    pub fn new(arena: Arena, sink: Arc<dyn ErrorSink>) -> Self {
        let slots = arena.capacity() / std::mem::size_of::<B::CommandBuffer>().max(1);
        Self {
            pending: Mutex::new(Pending {
                arena,
                buffers: Span::EMPTY,
                entries: Vec::with_capacity(slots),
                closed: false,
            }),
            sink,
        }
    }

    /// Queues `command` for the next frame submission.
    ///
    /// Fails with a recoverable `ArenaOutOfMemory` when the deferred arena
    /// is full; the producer gets the command back and must abort.
    pub fn push(&self, mut command: DeferredCommand<B>) -> Result<(), PushError<B>> {
        command.sync_flags();
        let mut pending = self.pending.lock();
        if pending.closed {
            let error = EngineError::recoverable(Origin::Uncategorized, "upload queue is closed");
            self.sink.report(&error);
            return Err(PushError { error, command });
        }

        let slot = match pending.arena.allocate::<B::CommandBuffer>(1) {
            Ok(slot) => slot,
            Err(e) => {
                let error = e.into_engine(Severity::Recoverable);
                self.sink.report(&error);
                return Err(PushError { error, command });
            }
        };
        let joined = pending.buffers.join(slot);
        let Some(buffers) = joined else {
            let arena = pending.arena.name();
            let error = EngineError::recoverable(
                Origin::IndexOutOfBounds,
                format!("arena `{arena}` returned a non-adjacent slot"),
            );
            let _ = pending.arena.deallocate(slot);
            self.sink.report(&error);
            return Err(PushError { error, command });
        };

        if let Ok(cells) = pending.arena.get_mut(slot) {
            cells[0] = command.command_buffer;
        }
        pending.buffers = buffers;
        pending.entries.push(command);
        tracing::trace!(queued = pending.entries.len(), "deferred command queued");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes left in the deferred arena.
    pub fn remaining(&self) -> usize {
        self.pending.lock().arena.remaining()
    }

    /// Moves every queued buffer, in push order, into a fresh `scratch`
    /// span and their follow-up work into `retired`, then clears the
    /// deferred arena. Nothing is taken when the scratch arena is full.
    pub(crate) fn drain_into(
        &self,
        scratch: &mut Arena,
        retired: &mut Vec<Retired<B>>,
    ) -> Result<Span<B::CommandBuffer>, EngineError> {
        let mut pending = self.pending.lock();
        if pending.entries.is_empty() {
            return Ok(Span::EMPTY);
        }

        let batch = scratch
            .allocate::<B::CommandBuffer>(pending.entries.len())
            .map_err(|e| e.into_engine(Severity::Recoverable))?;
        let copied = pending
            .arena
            .get(pending.buffers)
            .map_err(|e| e.into_engine(Severity::Fatal))
            .and_then(|queued| {
                scratch
                    .get_mut(batch)
                    .map(|out| out.copy_from_slice(queued))
                    .map_err(|e| e.into_engine(Severity::Fatal))
            });
        if let Err(e) = copied {
            let _ = scratch.deallocate(batch);
            return Err(e);
        }

        retired.extend(pending.entries.drain(..).map(DeferredCommand::retire));
        pending.buffers = Span::EMPTY;
        pending.arena.clear();
        Ok(batch)
    }

    /// Rejects further pushes.
    pub(crate) fn close(&self) {
        self.pending.lock().closed = true;
    }

    /// Completes everything still queued without submitting it. Only valid
    /// once the device is idle.
    pub(crate) fn discard(&self, backend: &B) {
        let mut pending = self.pending.lock();
        let leftover = pending.entries.len();
        for command in pending.entries.drain(..) {
            command.retire().complete(backend);
        }
        pending.buffers = Span::EMPTY;
        pending.arena.clear();
        if leftover > 0 {
            tracing::debug!(leftover, "discarded unsubmitted deferred commands");
        }
    }
}
