// SPDX-License-Identifier: CEPL-1.0
//! Scripted in-memory backend that records every driver call.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use ember_core::{EngineError, ErrorSink, Origin, Severity};
use ember_render::backend::{
    Acquired, ColorSpace, Format, PresentMode, PresentOutcome, QueueFamilies, SubmitBatch,
    SurfaceCaps, SurfaceFormat, SwapchainDesc,
};
use ember_render::{Backend, DriverError, DriverResult, EngineConfig, FrameEngine, RenderSize};
use parking_lot::Mutex;

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Handle(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateSwapchain { desc: SwapchainDesc, old: Handle, new: Handle },
    DestroySwapchain(Handle),
    CreateView(Handle),
    DestroyView(Handle),
    CreateSemaphore(Handle),
    DestroySemaphore(Handle),
    CreateFence(Handle),
    DestroyFence(Handle),
    WaitFence { fence: Handle, signaled: bool },
    ResetFence(Handle),
    AllocateCommandBuffers(usize),
    FreeCommandBuffers(usize),
    FreeOneShot(Handle),
    Begin(Handle),
    End(Handle),
    Submit {
        batches: Vec<Vec<Handle>>,
        waits: Vec<Option<Handle>>,
        signals: Vec<Option<Handle>>,
        fence: Option<Handle>,
        ok: bool,
    },
    Acquire { semaphore: Handle, result: DriverResult<u32> },
    Present { image: u32, wait: Handle },
    WaitIdle,
    Transition(usize),
    ReleaseStaging(u32),
    Custom(&'static str),
}

pub struct MockState {
    next: u64,
    pub calls: Vec<Call>,
    pub caps: SurfaceCaps,
    pub formats: Vec<SurfaceFormat>,
    pub modes: Vec<PresentMode>,
    /// Images the next swapchain reports beyond the requested count.
    pub extra_images: u32,
    /// Replaces the image count of every swapchain created from now on.
    pub image_count_override: Option<u32>,
    pub acquire_script: VecDeque<DriverResult<Acquired>>,
    pub present_script: VecDeque<DriverResult<PresentOutcome>>,
    pub submit_script: VecDeque<DriverResult<()>>,
    /// Fences that never signal, even when submitted.
    pub stuck_fences: HashSet<Handle>,
    signaled: HashSet<Handle>,
    live: HashSet<Handle>,
    swapchain_images: HashMap<Handle, u32>,
    next_image: u32,
}

impl MockState {
    fn fresh(&mut self) -> Handle {
        self.next += 1;
        let h = Handle(self.next);
        self.live.insert(h);
        h
    }

    fn kill(&mut self, h: Handle) {
        assert!(self.live.remove(&h), "double destroy of {h:?}");
    }

    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    pub fn is_signaled(&self, fence: Handle) -> bool {
        self.signaled.contains(&fence)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(pred)
    }

    pub fn submits(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Submit { batches, .. } if !batches.is_empty()))
            .collect()
    }
}

/// The state is shared so tests can inspect it after the engine is gone.
pub struct MockBackend {
    pub state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new(caps: SurfaceCaps) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next: 0,
                calls: Vec::new(),
                caps,
                formats: vec![
                    SurfaceFormat {
                        format: Format::B8G8R8A8_UNORM,
                        color_space: ColorSpace::SRGB_NONLINEAR,
                    },
                    SurfaceFormat {
                        format: Format::B8G8R8A8_SRGB,
                        color_space: ColorSpace::SRGB_NONLINEAR,
                    },
                ],
                modes: vec![PresentMode::FIFO, PresentMode::MAILBOX],
                extra_images: 0,
                image_count_override: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                submit_script: VecDeque::new(),
                stuck_fences: HashSet::new(),
                signaled: HashSet::new(),
                live: HashSet::new(),
                swapchain_images: HashMap::new(),
                next_image: 0,
            })),
        }
    }
}

/// Undefined current extent, 1..4096 limits, 2..3 images.
pub fn desktop_caps() -> SurfaceCaps {
    SurfaceCaps {
        current_extent: RenderSize::UNDEFINED,
        min_extent: RenderSize::new(1, 1),
        max_extent: RenderSize::new(4096, 4096),
        min_image_count: 2,
        max_image_count: 3,
    }
}

impl Backend for MockBackend {
    type Swapchain = Handle;
    type Image = Handle;
    type ImageView = Handle;
    type Semaphore = Handle;
    type Fence = Handle;
    type CommandBuffer = Handle;
    type Staging = u32;

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies::default()
    }

    fn surface_capabilities(&self) -> DriverResult<SurfaceCaps> {
        Ok(self.state.lock().caps)
    }

    fn surface_format_count(&self) -> DriverResult<usize> {
        Ok(self.state.lock().formats.len())
    }

    fn surface_formats(&self, out: &mut [SurfaceFormat]) -> DriverResult<usize> {
        let s = self.state.lock();
        let n = out.len().min(s.formats.len());
        out[..n].copy_from_slice(&s.formats[..n]);
        Ok(n)
    }

    fn present_mode_count(&self) -> DriverResult<usize> {
        Ok(self.state.lock().modes.len())
    }

    fn present_modes(&self, out: &mut [PresentMode]) -> DriverResult<usize> {
        let s = self.state.lock();
        let n = out.len().min(s.modes.len());
        out[..n].copy_from_slice(&s.modes[..n]);
        Ok(n)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: Handle) -> DriverResult<Handle> {
        let mut s = self.state.lock();
        let new = s.fresh();
        let images = s
            .image_count_override
            .unwrap_or(desc.image_count + s.extra_images);
        s.swapchain_images.insert(new, images);
        s.next_image = 0;
        s.calls.push(Call::CreateSwapchain {
            desc: *desc,
            old,
            new,
        });
        Ok(new)
    }

    fn destroy_swapchain(&self, swapchain: Handle) {
        let mut s = self.state.lock();
        s.kill(swapchain);
        s.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_image_count(&self, swapchain: Handle) -> DriverResult<usize> {
        let s = self.state.lock();
        s.swapchain_images
            .get(&swapchain)
            .map(|&n| n as usize)
            .ok_or(DriverError::Failed(-1))
    }

    fn swapchain_images(&self, swapchain: Handle, out: &mut [Handle]) -> DriverResult<()> {
        let base = swapchain.0 * 1_000;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = Handle(base + i as u64);
        }
        Ok(())
    }

    fn create_image_view(&self, image: Handle, _format: Format) -> DriverResult<Handle> {
        let mut s = self.state.lock();
        let view = s.fresh();
        s.calls.push(Call::CreateView(image));
        Ok(view)
    }

    fn destroy_image_view(&self, view: Handle) {
        let mut s = self.state.lock();
        s.kill(view);
        s.calls.push(Call::DestroyView(view));
    }

    fn create_semaphore(&self) -> DriverResult<Handle> {
        let mut s = self.state.lock();
        let h = s.fresh();
        s.calls.push(Call::CreateSemaphore(h));
        Ok(h)
    }

    fn destroy_semaphore(&self, semaphore: Handle) {
        let mut s = self.state.lock();
        s.kill(semaphore);
        s.calls.push(Call::DestroySemaphore(semaphore));
    }

    fn create_fence(&self) -> DriverResult<Handle> {
        let mut s = self.state.lock();
        let h = s.fresh();
        s.calls.push(Call::CreateFence(h));
        Ok(h)
    }

    fn destroy_fence(&self, fence: Handle) {
        let mut s = self.state.lock();
        s.kill(fence);
        s.signaled.remove(&fence);
        s.calls.push(Call::DestroyFence(fence));
    }

    fn wait_fence(&self, fence: Handle, _timeout: Duration) -> DriverResult<()> {
        let mut s = self.state.lock();
        let signaled = s.signaled.contains(&fence);
        s.calls.push(Call::WaitFence { fence, signaled });
        if signaled {
            Ok(())
        } else {
            Err(DriverError::Timeout)
        }
    }

    fn reset_fence(&self, fence: Handle) -> DriverResult<()> {
        let mut s = self.state.lock();
        s.signaled.remove(&fence);
        s.calls.push(Call::ResetFence(fence));
        Ok(())
    }

    fn allocate_command_buffers(&self, out: &mut [Handle]) -> DriverResult<()> {
        let mut s = self.state.lock();
        for slot in out.iter_mut() {
            *slot = s.fresh();
        }
        s.calls.push(Call::AllocateCommandBuffers(out.len()));
        Ok(())
    }

    fn free_command_buffers(&self, buffers: &[Handle]) {
        let mut s = self.state.lock();
        for &b in buffers {
            s.kill(b);
        }
        s.calls.push(Call::FreeCommandBuffers(buffers.len()));
    }

    fn free_one_shot(&self, buffer: Handle) {
        self.state.lock().calls.push(Call::FreeOneShot(buffer));
    }

    fn begin_command_buffer(&self, buffer: Handle) -> DriverResult<()> {
        self.state.lock().calls.push(Call::Begin(buffer));
        Ok(())
    }

    fn end_command_buffer(&self, buffer: Handle) -> DriverResult<()> {
        self.state.lock().calls.push(Call::End(buffer));
        Ok(())
    }

    fn submit(&self, batches: &[SubmitBatch<'_, Self>], fence: Option<Handle>) -> DriverResult<()> {
        let mut s = self.state.lock();
        let result = if batches.is_empty() {
            Ok(())
        } else {
            s.submit_script.pop_front().unwrap_or(Ok(()))
        };
        s.calls.push(Call::Submit {
            batches: batches.iter().map(|b| b.command_buffers.to_vec()).collect(),
            waits: batches.iter().map(|b| b.wait).collect(),
            signals: batches.iter().map(|b| b.signal).collect(),
            fence,
            ok: result.is_ok(),
        });
        if let (Ok(()), Some(f)) = (result, fence) {
            if !s.stuck_fences.contains(&f) {
                s.signaled.insert(f);
            }
        }
        result
    }

    fn acquire_next_image(
        &self,
        swapchain: Handle,
        signal: Handle,
        _timeout: Duration,
    ) -> DriverResult<Acquired> {
        let mut s = self.state.lock();
        let count = s.swapchain_images.get(&swapchain).copied().unwrap_or(1);
        let result = s.acquire_script.pop_front().unwrap_or_else(|| {
            Ok(Acquired {
                index: s.next_image % count,
                suboptimal: false,
            })
        });
        if let Ok(a) = result {
            s.next_image = a.index + 1;
        }
        s.calls.push(Call::Acquire {
            semaphore: signal,
            result: result.map(|a| a.index),
        });
        result
    }

    fn present(&self, _swapchain: Handle, image_index: u32, wait: Handle) -> DriverResult<PresentOutcome> {
        let mut s = self.state.lock();
        s.calls.push(Call::Present {
            image: image_index,
            wait,
        });
        s.present_script
            .pop_front()
            .unwrap_or(Ok(PresentOutcome::Optimal))
    }

    fn wait_graphics_idle(&self) -> DriverResult<()> {
        self.state.lock().calls.push(Call::WaitIdle);
        Ok(())
    }

    fn transition_to_present(&self, images: &[Handle]) -> DriverResult<()> {
        self.state.lock().calls.push(Call::Transition(images.len()));
        Ok(())
    }

    fn release_staging(&self, staging: u32) {
        self.state.lock().calls.push(Call::ReleaseStaging(staging));
    }
}

/// Collects every reported error.
#[derive(Clone, Default)]
pub struct RecordingSink(pub Arc<Mutex<Vec<EngineError>>>);

impl RecordingSink {
    pub fn origins(&self) -> Vec<(Severity, Origin)> {
        self.0.lock().iter().map(|e| (e.severity, e.origin)).collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, err: &EngineError) {
        self.0.lock().push(err.clone());
    }
}

pub fn engine_with(
    caps: SurfaceCaps,
    cfg: EngineConfig,
    size: RenderSize,
) -> (FrameEngine<MockBackend>, RecordingSink) {
    let sink = RecordingSink::default();
    let engine = FrameEngine::new(MockBackend::new(caps), &cfg, size, Arc::new(sink.clone()))
        .expect("engine builds");
    (engine, sink)
}

pub fn engine() -> (FrameEngine<MockBackend>, RecordingSink) {
    engine_with(desktop_caps(), EngineConfig::default(), RenderSize::new(800, 600))
}
