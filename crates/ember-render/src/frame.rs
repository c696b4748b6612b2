// SPDX-License-Identifier: CEPL-1.0
//! Per-frame acquire / record / submit / present protocol.
//!
//! Per-frame objects (image-available semaphore, in-flight fence, command
//! buffer) are indexed by the frame cursor. Per-image objects (image, view,
//! render-finished semaphore) are indexed by whatever image the swapchain
//! hands out; the two are not assumed to match.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ember_core::{Arena, EngineError, ErrorSink, Origin, Severity};

use crate::backend::{
    Backend, DriverError, PresentMode, PresentOutcome, SubmitBatch, SurfaceFormat,
};
use crate::config::EngineConfig;
use crate::swapchain::{BuildRequest, Swapchain, SwapchainState};
use crate::upload::{Retired, UploadQueue};
use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Acquired,
    /// `begin_frame` returned; the caller is recording.
    Recorded,
    Submitted,
}

/// Everything the caller needs to record one frame.
pub struct FrameTarget<B: Backend> {
    pub command_buffer: B::CommandBuffer,
    pub image: B::Image,
    pub image_view: B::ImageView,
    pub image_index: u32,
    pub frame_index: u32,
    pub extent: RenderSize,
}

impl<B: Backend> Clone for FrameTarget<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for FrameTarget<B> {}

impl<B: Backend> fmt::Debug for FrameTarget<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTarget")
            .field("command_buffer", &self.command_buffer)
            .field("image", &self.image)
            .field("image_index", &self.image_index)
            .field("frame_index", &self.frame_index)
            .field("extent", &self.extent)
            .finish()
    }
}

#[derive(Debug)]
pub enum FrameStatus<B: Backend> {
    Ready(FrameTarget<B>),
    /// Nothing to record this time around (minimized, rebuilding, skipped).
    NotReady,
}

impl<B: Backend> FrameStatus<B> {
    pub fn ready(self) -> Option<FrameTarget<B>> {
        match self {
            FrameStatus::Ready(target) => Some(target),
            FrameStatus::NotReady => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Dropped,
}

#[derive(Clone, Copy)]
struct OpenFrame {
    image_index: u32,
    suboptimal: bool,
}

type SwapchainListener<B> = Box<dyn FnMut(RenderSize, u32, &[<B as Backend>::ImageView])>;

pub struct FrameEngine<B: Backend> {
    swapchain: Swapchain<B>,
    scratch: Arena,
    uploads: Arc<UploadQueue<B>>,
    sink: Arc<dyn ErrorSink>,
    listeners: Vec<SwapchainListener<B>>,

    framebuffer: RenderSize,
    desired_images: u32,
    vsync: bool,
    fence_timeout: Duration,

    current_frame: u32,
    phase: FramePhase,
    open: Option<OpenFrame>,
    needs_rebuild: bool,
    /// Cursor slot that last rendered to each image.
    image_owner: Vec<Option<u32>>,
    /// Follow-up work per cursor slot, run once that slot's fence signalled.
    retired: Vec<Vec<Retired<B>>>,
    frames_rendered: u64,

    // dropped last: Drop for FrameEngine still needs it
    backend: B,
}

impl<B: Backend> FrameEngine<B> {
    /// Builds the first swapchain generation for `framebuffer`.
    pub fn new(
        backend: B,
        cfg: &EngineConfig,
        framebuffer: RenderSize,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self, EngineError> {
        if let Err(e) = cfg.validate() {
            sink.report(&e);
            return Err(e);
        }

        let uploads = Arc::new(UploadQueue::new(
            Arena::new("deferred-commands", cfg.upload_arena_bytes),
            sink.clone(),
        ));
        let mut engine = Self {
            swapchain: Swapchain::new(Arena::new("swapchain-resources", cfg.swapchain_arena_bytes)),
            scratch: Arena::new("scratch", cfg.scratch_arena_bytes),
            uploads,
            sink,
            listeners: Vec::new(),
            framebuffer,
            desired_images: cfg.frames_in_flight,
            vsync: cfg.vsync,
            fence_timeout: cfg.fence_timeout(),
            current_frame: 0,
            phase: FramePhase::Idle,
            open: None,
            needs_rebuild: false,
            image_owner: Vec::new(),
            retired: Vec::new(),
            frames_rendered: 0,
            backend,
        };
        engine.rebuild()?;
        Ok(engine)
    }

    /// Acquires an image and opens the cursor slot's command buffer.
    ///
    /// `Ok(NotReady)` means skip this frame; `Err` is always fatal.
    pub fn begin_frame(&mut self) -> Result<FrameStatus<B>, EngineError> {
        if self.phase != FramePhase::Idle {
            tracing::debug!("begin_frame while a frame is open");
            return Ok(FrameStatus::NotReady);
        }
        if self.needs_rebuild {
            self.rebuild()?;
        }
        let Some(image_count) = self.swapchain.ready_image_count() else {
            return Ok(FrameStatus::NotReady);
        };
        let Some(handle) = self.swapchain.generation().map(|g| g.handle) else {
            return Ok(FrameStatus::NotReady);
        };
        if self.current_frame >= image_count {
            return Err(self.fatal(EngineError::fatal(
                Origin::IndexOutOfBounds,
                format!("frame cursor {} >= {image_count}", self.current_frame),
            )));
        }
        let frame = self.current_frame as usize;

        let fence = self.swapchain.in_flight(frame).map_err(|e| self.fatal(e))?;
        if !self.wait_slot(frame, fence)? {
            return Ok(FrameStatus::NotReady);
        }

        let available = self
            .swapchain
            .image_available(frame)
            .map_err(|e| self.fatal(e))?;
        let acquired = match self
            .backend
            .acquire_next_image(handle, available, self.fence_timeout)
        {
            Ok(acquired) => acquired,
            Err(DriverError::OutOfDate) => {
                tracing::debug!("acquire: swapchain out of date");
                self.rebuild()?;
                return Ok(FrameStatus::NotReady);
            }
            Err(DriverError::Timeout) => {
                self.report(DriverError::Timeout.into_engine(Severity::Recoverable, "acquire"));
                return Ok(FrameStatus::NotReady);
            }
            Err(e) => return Err(self.fatal(e.into_engine(Severity::Fatal, "acquire"))),
        };
        self.phase = FramePhase::Acquired;

        let image_index = acquired.index as usize;
        if image_index >= image_count as usize {
            return Err(self.fatal(EngineError::fatal(
                Origin::IndexOutOfBounds,
                format!("acquired image {image_index} >= {image_count}"),
            )));
        }
        if let Some(owner) = self.image_owner[image_index].filter(|&o| o != self.current_frame) {
            let owner_fence = self
                .swapchain
                .in_flight(owner as usize)
                .map_err(|e| self.fatal(e))?;
            if !self.wait_slot(owner as usize, owner_fence)? {
                // the acquire already signalled; only a rebuild resets that
                self.needs_rebuild = true;
                self.phase = FramePhase::Idle;
                return Ok(FrameStatus::NotReady);
            }
        }
        self.image_owner[image_index] = Some(self.current_frame);

        if let Err(e) = self.backend.reset_fence(fence) {
            return Err(self.fatal(e.into_engine(Severity::Fatal, "reset fence")));
        }
        let command_buffer = self
            .swapchain
            .command_buffer(frame)
            .map_err(|e| self.fatal(e))?;
        if let Err(e) = self.backend.begin_command_buffer(command_buffer) {
            return Err(self.fatal(e.into_engine(Severity::Fatal, "begin command buffer")));
        }

        let target = FrameTarget {
            command_buffer,
            image: self.swapchain.image(image_index).map_err(|e| self.fatal(e))?,
            image_view: self
                .swapchain
                .image_view(image_index)
                .map_err(|e| self.fatal(e))?,
            image_index: acquired.index,
            frame_index: self.current_frame,
            extent: self.extent(),
        };
        self.open = Some(OpenFrame {
            image_index: acquired.index,
            suboptimal: acquired.suboptimal,
        });
        self.phase = FramePhase::Recorded;
        tracing::trace!(frame = frame, image = image_index, "frame begun");
        Ok(FrameStatus::Ready(target))
    }

    /// Submits the open frame plus every deferred command and presents it.
    pub fn end_frame(&mut self) -> Result<FrameOutcome, EngineError> {
        let open = match (self.phase, self.open) {
            (FramePhase::Recorded, Some(open)) => open,
            _ => {
                self.report(EngineError::recoverable(
                    Origin::Uncategorized,
                    "end_frame without an open frame",
                ));
                return Ok(FrameOutcome::Dropped);
            }
        };
        self.open = None;

        let frame = self.current_frame as usize;
        let image_count = self.swapchain.ready_image_count().unwrap_or(1);
        let Some(handle) = self.swapchain.generation().map(|g| g.handle) else {
            self.phase = FramePhase::Idle;
            return Ok(FrameOutcome::Dropped);
        };
        let command_buffer = self
            .swapchain
            .command_buffer(frame)
            .map_err(|e| self.fatal(e))?;
        let available = self
            .swapchain
            .image_available(frame)
            .map_err(|e| self.fatal(e))?;
        let finished = self
            .swapchain
            .render_finished(open.image_index as usize)
            .map_err(|e| self.fatal(e))?;
        let fence = self.swapchain.in_flight(frame).map_err(|e| self.fatal(e))?;

        if let Err(e) = self.backend.end_command_buffer(command_buffer) {
            return Err(self.fatal(e.into_engine(Severity::Fatal, "end command buffer")));
        }

        let deferred = match self
            .uploads
            .drain_into(&mut self.scratch, &mut self.retired[frame])
        {
            Ok(span) => span,
            Err(e) => {
                // queued work stays for the next frame
                self.report(e);
                ember_core::Span::EMPTY
            }
        };

        let submitted = {
            let primary = [command_buffer];
            let extra = self.scratch.get(deferred).unwrap_or_default();
            let batches = [
                SubmitBatch::<B> {
                    wait: Some(available),
                    command_buffers: &primary,
                    signal: Some(finished),
                },
                SubmitBatch::<B> {
                    wait: None,
                    command_buffers: extra,
                    signal: None,
                },
            ];
            let used = if extra.is_empty() { 1 } else { 2 };
            self.backend.submit(&batches[..used], Some(fence))
        };
        if let Err(e) = self.scratch.deallocate(deferred) {
            return Err(self.fatal(e.into_engine(Severity::Fatal)));
        }

        if let Err(e) = submitted {
            self.report(e.into_engine(Severity::Recoverable, "submit"));
            // keep the slot waitable; its retired work runs on the next wait
            if let Err(e) = self.backend.submit(&[], Some(fence)) {
                return Err(self.fatal(e.into_engine(Severity::Fatal, "re-signal fence")));
            }
            self.needs_rebuild = true;
            self.phase = FramePhase::Idle;
            return Ok(FrameOutcome::Dropped);
        }
        self.phase = FramePhase::Submitted;

        let presented = self.backend.present(handle, open.image_index, finished);
        self.current_frame = (self.current_frame + 1) % image_count;
        self.frames_rendered += 1;
        self.phase = FramePhase::Idle;

        match presented {
            Ok(PresentOutcome::Optimal) if !open.suboptimal => Ok(FrameOutcome::Presented),
            Ok(_) => {
                tracing::debug!("present: suboptimal, rebuilding");
                self.rebuild()?;
                Ok(FrameOutcome::Presented)
            }
            Err(DriverError::OutOfDate) => {
                tracing::debug!("present: out of date, rebuilding");
                self.rebuild()?;
                Ok(FrameOutcome::Dropped)
            }
            Err(e) => {
                self.report(e.into_engine(Severity::Recoverable, "present"));
                Ok(FrameOutcome::Dropped)
            }
        }
    }

    /// New framebuffer size; rebuilds now, or after the open frame ends.
    pub fn resize(&mut self, framebuffer: RenderSize) -> Result<(), EngineError> {
        self.framebuffer = framebuffer;
        if self.phase == FramePhase::Idle {
            self.rebuild()
        } else {
            self.needs_rebuild = true;
            Ok(())
        }
    }

    pub fn set_vsync(&mut self, on: bool) -> Result<(), EngineError> {
        if self.vsync == on {
            return Ok(());
        }
        self.vsync = on;
        if self.phase == FramePhase::Idle {
            self.rebuild()
        } else {
            self.needs_rebuild = true;
            Ok(())
        }
    }

    /// Registers a listener for new swapchain generations. A built
    /// generation is reported to it right away.
    pub fn on_swapchain_change(
        &mut self,
        mut listener: impl FnMut(RenderSize, u32, &[B::ImageView]) + 'static,
    ) {
        if let Some(count) = self.swapchain.ready_image_count() {
            listener(self.extent(), count, self.swapchain.image_views());
        }
        self.listeners.push(Box::new(listener));
    }

    /// Blocks until the GPU is idle and runs every retired action.
    pub fn wait_idle(&mut self) -> Result<(), EngineError> {
        if let Err(e) = self.backend.wait_graphics_idle() {
            return Err(self.fatal(e.into_engine(Severity::Fatal, "wait idle")));
        }
        complete_all(&self.backend, &mut self.retired);
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn upload_queue(&self) -> Arc<UploadQueue<B>> {
        self.uploads.clone()
    }

    pub fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }

    pub fn swapchain(&self) -> &Swapchain<B> {
        &self.swapchain
    }

    pub fn scratch(&self) -> &Arena {
        &self.scratch
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// Zero while the swapchain is absent or degenerate.
    pub fn image_count(&self) -> u32 {
        self.swapchain.ready_image_count().unwrap_or(0)
    }

    pub fn is_ready(&self) -> bool {
        self.swapchain.state() == SwapchainState::Built
    }

    pub fn extent(&self) -> RenderSize {
        self.swapchain
            .generation()
            .map(|g| g.extent)
            .unwrap_or(RenderSize::ZERO)
    }

    pub fn framebuffer(&self) -> RenderSize {
        self.framebuffer
    }

    pub fn image_view(&self, index: u32) -> Option<B::ImageView> {
        self.swapchain.image_view(index as usize).ok()
    }

    pub fn surface_format(&self) -> Option<SurfaceFormat> {
        self.swapchain.generation().map(|g| g.format)
    }

    pub fn present_mode(&self) -> Option<PresentMode> {
        self.swapchain.generation().map(|g| g.present_mode)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    fn rebuild(&mut self) -> Result<(), EngineError> {
        self.needs_rebuild = false;
        self.open = None;
        let request = BuildRequest {
            framebuffer: self.framebuffer,
            desired_images: self.desired_images,
            vsync: self.vsync,
        };
        let retired = &mut self.retired;
        let state = self
            .swapchain
            .rebuild(&self.backend, &mut self.scratch, &request, |backend| {
                complete_all(backend, retired)
            })
            .map_err(|e| self.fatal(e))?;

        let count = self.image_count() as usize;
        self.current_frame = 0;
        self.phase = FramePhase::Idle;
        self.image_owner.clear();
        self.image_owner.resize(count, None);
        self.retired.resize_with(count.max(1), Vec::new);

        if state != SwapchainState::Built {
            return Ok(());
        }

        let extent = self.extent();
        for listener in self.listeners.iter_mut() {
            listener(extent, count as u32, self.swapchain.image_views());
        }
        if let Err(e) = self.backend.transition_to_present(self.swapchain.images()) {
            return Err(self.fatal(e.into_engine(Severity::Fatal, "transition to present")));
        }
        Ok(())
    }

    /// Waits on a cursor slot's fence and runs the work retired there.
    /// `Ok(false)` on timeout.
    fn wait_slot(&mut self, slot: usize, fence: B::Fence) -> Result<bool, EngineError> {
        match self.backend.wait_fence(fence, self.fence_timeout) {
            Ok(()) => {
                if let Some(pending) = self.retired.get_mut(slot) {
                    for work in pending.drain(..) {
                        work.complete(&self.backend);
                    }
                }
                Ok(true)
            }
            Err(DriverError::Timeout) => {
                self.report(EngineError::recoverable(
                    Origin::DriverError,
                    format!("in-flight fence of frame {slot} timed out after {:?}", self.fence_timeout),
                ));
                Ok(false)
            }
            Err(e) => Err(self.fatal(e.into_engine(Severity::Fatal, "wait fence"))),
        }
    }

    fn report(&self, err: EngineError) {
        self.sink.report(&err);
    }

    fn fatal(&self, err: EngineError) -> EngineError {
        self.sink.report(&err);
        err
    }
}

fn complete_all<B: Backend>(backend: &B, retired: &mut [Vec<Retired<B>>]) {
    for slot in retired.iter_mut() {
        for work in slot.drain(..) {
            work.complete(backend);
        }
    }
}

impl<B: Backend> Drop for FrameEngine<B> {
    fn drop(&mut self) {
        self.uploads.close();
        if let Err(e) = self.backend.wait_graphics_idle() {
            tracing::error!("wait idle during teardown: {e}");
        }
        complete_all(&self.backend, &mut self.retired);
        self.uploads.discard(&self.backend);
        if let Err(e) = self.swapchain.destroy(&self.backend) {
            tracing::error!("swapchain teardown: {e}");
        }
        tracing::info!(frames = self.frames_rendered, "frame engine destroyed");
    }
}
