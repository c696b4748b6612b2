// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;
use ember_core::{EngineError, ErrorSink, Severity};
use ember_render::{
    Backend, DeferredCommand, DriverError, EngineConfig, FrameEngine, FrameOutcome, FrameStatus,
    PushError, RenderSize, Renderer, SubmitAction, UploadQueue,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

use crate::backend::{CommandBuffer, ImageView, Staging, VkBackend};

pub struct VkRenderer {
    engine: FrameEngine<VkBackend>,
    clear: [f32; 4],
}

impl VkRenderer {
    pub fn engine(&self) -> &FrameEngine<VkBackend> {
        &self.engine
    }

    pub fn backend(&self) -> &VkBackend {
        self.engine.backend()
    }

    pub fn upload_queue(&self) -> Arc<UploadQueue<VkBackend>> {
        self.engine.upload_queue()
    }

    pub fn on_swapchain_change(
        &mut self,
        listener: impl FnMut(RenderSize, u32, &[ImageView]) + 'static,
    ) {
        self.engine.on_swapchain_change(listener);
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.backend().transfer_queue()
    }

    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.backend().msaa_samples()
    }

    fn recoverable(&self, err: DriverError, what: &str) -> EngineError {
        let err = err.into_engine(Severity::Recoverable, what);
        self.engine.sink().report(&err);
        err
    }

    /// Starts a one-shot command buffer for work that should ride along
    /// with the next frame's submit.
    ///
    /// `VkRenderer` is not `Sync`, so the one-shot helpers run on the thread
    /// that owns it. Only [`UploadQueue::push`] is open to other threads.
    pub fn begin_one_shot(&self) -> Result<CommandBuffer, EngineError> {
        self.backend()
            .begin_one_shot()
            .map_err(|e| self.recoverable(e, "begin one-shot"))
    }

    /// Ends `cmd` and hands it to the deferred queue. The buffer is freed,
    /// and `staging` released, once the frame that carried it completed.
    /// On failure both are released right away.
    pub fn enqueue_one_shot(
        &self,
        cmd: CommandBuffer,
        staging: Option<Staging>,
    ) -> Result<(), EngineError> {
        let backend = self.backend();
        if let Err(e) = backend.end_one_shot(cmd) {
            discard(backend, Some(cmd), staging);
            return Err(self.recoverable(e, "end one-shot"));
        }

        let mut command = DeferredCommand::new(cmd).free_after_submit();
        if let Some(staging) = staging {
            command = command.on_submit(SubmitAction::ReleaseStaging(staging));
        }
        self.engine
            .upload_queue()
            .push(command)
            .map_err(|PushError { error, command }| {
                if let Some(action) = command.on_submit {
                    action.run(backend);
                }
                discard(backend, Some(command.command_buffer), None);
                error
            })
    }

    /// Copies `data` into `dst` on the next submitted frame.
    pub fn upload_buffer(&self, dst: vk::Buffer, data: &[u8]) -> Result<(), EngineError> {
        let backend = self.backend();
        let staging = backend
            .create_staging(data)
            .map_err(|e| self.recoverable(e, "create staging buffer"))?;
        let cmd = match self.begin_one_shot() {
            Ok(cmd) => cmd,
            Err(e) => {
                discard(backend, None, Some(staging));
                return Err(e);
            }
        };
        backend.record_buffer_copy(cmd, &staging, dst);
        self.enqueue_one_shot(cmd, Some(staging))
    }
}

/// Releases a one-shot that never reached the deferred queue.
fn discard(backend: &VkBackend, cmd: Option<CommandBuffer>, staging: Option<Staging>) {
    if let Some(staging) = staging {
        backend.release_staging(staging);
    }
    if let Some(cmd) = cmd {
        backend.free_one_shot(cmd);
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &EngineConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self, EngineError> {
        let backend = match VkBackend::new(window, display, cfg) {
            Ok(backend) => backend,
            Err(e) => {
                sink.report(&e);
                return Err(e);
            }
        };
        let engine = FrameEngine::new(backend, cfg, size, sink)?;
        info!(
            "vk: renderer up, {} images, extent {}x{}",
            engine.image_count(),
            engine.extent().width,
            engine.extent().height
        );
        Ok(Self {
            engine,
            clear: cfg.clear_color,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<(), EngineError> {
        if size.is_degenerate() != self.engine.framebuffer().is_degenerate() {
            info!(
                "vk: resize to {}x{} → paused={}",
                size.width,
                size.height,
                size.is_degenerate()
            );
        }
        self.engine.resize(size)
    }

    // STRICT PER-FRAME ORDER:
    // 1) begin_frame (fence wait, acquire, command buffer begun)
    // 2) record: to color, clear, to present
    // 3) end_frame (submit signals render-finished for THIS image, present waits on it)
    fn render(&mut self) -> Result<FrameOutcome, EngineError> {
        let target = match self.engine.begin_frame()? {
            FrameStatus::Ready(target) => target,
            FrameStatus::NotReady => return Ok(FrameOutcome::Dropped),
        };
        self.engine.backend().record_clear(&target, self.clear);
        self.engine.end_frame()
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    fn set_vsync(&mut self, on: bool) -> Result<(), EngineError> {
        self.engine.set_vsync(on)
    }
}
