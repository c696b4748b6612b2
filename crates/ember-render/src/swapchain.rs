// SPDX-License-Identifier: CEPL-1.0
//! Swapchain generations.
//!
//! A generation is the swapchain plus every per-image object built for it.
//! It is only ever replaced wholesale: [`Swapchain::rebuild`] creates the new
//! swapchain, idles the GPU, destroys the old generation, then fills the
//! `swapchain-resources` arena again from scratch.

use ember_core::{Arena, ArenaError, EngineError, Origin, Severity, Span};

use crate::backend::{
    Backend, DriverError, Format, PresentMode, SurfaceCaps, SurfaceFormat, SwapchainDesc,
};
use crate::RenderSize;

pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;

/// B8G8R8A8_SRGB in the sRGB non-linear color space, else the first entry.
pub fn choose_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == Format::B8G8R8A8_SRGB
                && f.color_space == crate::backend::ColorSpace::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX if offered, else FIFO. Without vsync IMMEDIATE is tried first.
pub fn choose_present_mode(modes: &[PresentMode], vsync: bool) -> PresentMode {
    let preference: &[PresentMode] = if vsync {
        &[PresentMode::MAILBOX]
    } else {
        &[PresentMode::IMMEDIATE, PresentMode::MAILBOX]
    };
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(PresentMode::FIFO)
}

pub fn resolve_extent(caps: &SurfaceCaps, framebuffer: RenderSize) -> RenderSize {
    if caps.current_extent != RenderSize::UNDEFINED {
        return caps.current_extent;
    }
    RenderSize {
        width: framebuffer
            .width
            .clamp(caps.min_extent.width, caps.max_extent.width),
        height: framebuffer
            .height
            .clamp(caps.min_extent.height, caps.max_extent.height),
    }
}

pub fn resolve_image_count(caps: &SurfaceCaps, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Absent,
    /// Built for a zero-sized framebuffer; holds no objects.
    Degenerate,
    Built,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    pub framebuffer: RenderSize,
    pub desired_images: u32,
    pub vsync: bool,
}

/// One swapchain and its per-image arrays. All spans have `image_count`
/// elements and live in the `swapchain-resources` arena.
pub struct Generation<B: Backend> {
    pub handle: B::Swapchain,
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: RenderSize,
    pub image_count: u32,
    pub images: Span<B::Image>,
    pub views: Span<B::ImageView>,
    pub render_finished: Span<B::Semaphore>,
    pub image_available: Span<B::Semaphore>,
    pub in_flight: Span<B::Fence>,
    pub command_buffers: Span<B::CommandBuffer>,
}

impl<B: Backend> Generation<B> {
    fn empty(handle: B::Swapchain, desc: &SwapchainDesc) -> Self {
        Self {
            handle,
            format: desc.format,
            present_mode: desc.present_mode,
            extent: desc.extent,
            image_count: 0,
            images: Span::EMPTY,
            views: Span::EMPTY,
            render_finished: Span::EMPTY,
            image_available: Span::EMPTY,
            in_flight: Span::EMPTY,
            command_buffers: Span::EMPTY,
        }
    }
}

pub struct Swapchain<B: Backend> {
    arena: Arena,
    current: Option<Generation<B>>,
    degenerate: bool,
}

impl<B: Backend> Swapchain<B> {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            current: None,
            degenerate: false,
        }
    }

    pub fn state(&self) -> SwapchainState {
        match (&self.current, self.degenerate) {
            (Some(_), _) => SwapchainState::Built,
            (None, true) => SwapchainState::Degenerate,
            (None, false) => SwapchainState::Absent,
        }
    }

    pub fn generation(&self) -> Option<&Generation<B>> {
        self.current.as_ref()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Destroys the current generation and builds the next one.
    ///
    /// `on_idle` runs after the GPU went idle and before any old object is
    /// destroyed. Every failure is fatal.
    pub fn rebuild(
        &mut self,
        backend: &B,
        scratch: &mut Arena,
        request: &BuildRequest,
        on_idle: impl FnOnce(&B),
    ) -> Result<SwapchainState, EngineError> {
        if request.framebuffer.is_degenerate() {
            self.retire(backend, on_idle)?;
            self.degenerate = true;
            tracing::debug!("framebuffer is {:?}, swapchain degenerate", request.framebuffer);
            return Ok(SwapchainState::Degenerate);
        }

        let caps = backend
            .surface_capabilities()
            .map_err(|e| fatal(e, "surface capabilities"))?;
        let (format, present_mode) = negotiate(backend, scratch, request.vsync)?;
        let extent = resolve_extent(&caps, request.framebuffer);
        if extent.is_degenerate() {
            self.retire(backend, on_idle)?;
            self.degenerate = true;
            return Ok(SwapchainState::Degenerate);
        }

        let desc = SwapchainDesc {
            format,
            present_mode,
            extent,
            image_count: resolve_image_count(&caps, request.desired_images),
            families: backend.queue_families(),
        };
        let old = self
            .current
            .as_ref()
            .map(|g| g.handle)
            .unwrap_or_default();
        let handle = backend
            .create_swapchain(&desc, old)
            .map_err(|e| fatal(e, "create swapchain"))?;

        if let Err(e) = self.retire(backend, on_idle) {
            backend.destroy_swapchain(handle);
            return Err(e);
        }

        let mut generation = Generation::empty(handle, &desc);
        if let Err(e) = self.populate(backend, &mut generation) {
            destroy_generation(backend, &self.arena, &generation);
            self.arena.clear();
            return Err(e);
        }

        tracing::info!(
            "swapchain built: {}x{} {} {} images={}",
            generation.extent.width,
            generation.extent.height,
            generation.format.format.name(),
            generation.present_mode.name(),
            generation.image_count,
        );
        self.current = Some(generation);
        Ok(SwapchainState::Built)
    }

    /// Idles the GPU and releases every object. Leaves the swapchain absent.
    pub fn destroy(&mut self, backend: &B) -> Result<(), EngineError> {
        self.retire(backend, |_| {})?;
        self.degenerate = false;
        Ok(())
    }

    fn retire(&mut self, backend: &B, on_idle: impl FnOnce(&B)) -> Result<(), EngineError> {
        backend
            .wait_graphics_idle()
            .map_err(|e| fatal(e, "wait graphics idle"))?;
        on_idle(backend);
        if let Some(old) = self.current.take() {
            destroy_generation(backend, &self.arena, &old);
        }
        self.arena.clear();
        self.degenerate = false;
        Ok(())
    }

    // STRICT ORDER: images, views, render-finished, image-available, fences,
    // command buffers. Handles still zero on failure were never created.
    fn populate(&mut self, backend: &B, g: &mut Generation<B>) -> Result<(), EngineError> {
        let count = backend
            .swapchain_image_count(g.handle)
            .map_err(|e| fatal(e, "swapchain image count"))?;
        if count == 0 {
            return Err(fatal(
                DriverError::Failed(0),
                "swapchain reported no images",
            ));
        }
        g.image_count = u32::try_from(count).map_err(|_| {
            EngineError::fatal(Origin::IndexOutOfBounds, format!("{count} swapchain images"))
        })?;

        let arena = &mut self.arena;
        g.images = arena.allocate(count).map_err(arena_fatal)?;
        g.views = arena.allocate(count).map_err(arena_fatal)?;
        g.render_finished = arena.allocate(count).map_err(arena_fatal)?;
        g.image_available = arena.allocate(count).map_err(arena_fatal)?;
        g.in_flight = arena.allocate(count).map_err(arena_fatal)?;
        g.command_buffers = arena.allocate(count).map_err(arena_fatal)?;

        backend
            .swapchain_images(g.handle, arena.get_mut(g.images).map_err(arena_fatal)?)
            .map_err(|e| fatal(e, "swapchain images"))?;
        backend
            .allocate_command_buffers(arena.get_mut(g.command_buffers).map_err(arena_fatal)?)
            .map_err(|e| fatal(e, "allocate command buffers"))?;

        for i in 0..count {
            let image = arena.get(g.images).map_err(arena_fatal)?[i];
            let view = backend
                .create_image_view(image, g.format.format)
                .map_err(|e| fatal(e, "create image view"))?;
            arena.get_mut(g.views).map_err(arena_fatal)?[i] = view;

            let finished = backend
                .create_semaphore()
                .map_err(|e| fatal(e, "create semaphore"))?;
            arena.get_mut(g.render_finished).map_err(arena_fatal)?[i] = finished;

            let available = backend
                .create_semaphore()
                .map_err(|e| fatal(e, "create semaphore"))?;
            arena.get_mut(g.image_available).map_err(arena_fatal)?[i] = available;

            let fence = backend
                .create_fence()
                .map_err(|e| fatal(e, "create fence"))?;
            arena.get_mut(g.in_flight).map_err(arena_fatal)?[i] = fence;

            // an empty submission signals the fence so the first wait returns
            backend
                .submit(&[], Some(fence))
                .map_err(|e| fatal(e, "signal fence"))?;
        }
        Ok(())
    }

    /// Image count of a built generation, `None` while absent or degenerate.
    pub fn ready_image_count(&self) -> Option<u32> {
        self.current
            .as_ref()
            .map(|g| g.image_count)
            .filter(|&n| n > 0)
    }

    pub fn images(&self) -> &[B::Image] {
        self.slice(|g| g.images)
    }

    pub fn image_views(&self) -> &[B::ImageView] {
        self.slice(|g| g.views)
    }

    pub fn fences(&self) -> &[B::Fence] {
        self.slice(|g| g.in_flight)
    }

    pub fn image(&self, index: usize) -> Result<B::Image, EngineError> {
        self.at(|g| g.images, index, "image")
    }

    pub fn image_view(&self, index: usize) -> Result<B::ImageView, EngineError> {
        self.at(|g| g.views, index, "image view")
    }

    pub fn render_finished(&self, index: usize) -> Result<B::Semaphore, EngineError> {
        self.at(|g| g.render_finished, index, "render-finished semaphore")
    }

    pub fn image_available(&self, frame: usize) -> Result<B::Semaphore, EngineError> {
        self.at(|g| g.image_available, frame, "image-available semaphore")
    }

    pub fn in_flight(&self, frame: usize) -> Result<B::Fence, EngineError> {
        self.at(|g| g.in_flight, frame, "in-flight fence")
    }

    pub fn command_buffer(&self, frame: usize) -> Result<B::CommandBuffer, EngineError> {
        self.at(|g| g.command_buffers, frame, "command buffer")
    }

    fn slice<T: bytemuck::Pod>(&self, span: impl FnOnce(&Generation<B>) -> Span<T>) -> &[T] {
        self.current
            .as_ref()
            .and_then(|g| self.arena.get(span(g)).ok())
            .unwrap_or_default()
    }

    fn at<T: bytemuck::Pod>(
        &self,
        span: impl FnOnce(&Generation<B>) -> Span<T>,
        index: usize,
        what: &str,
    ) -> Result<T, EngineError> {
        let Some(g) = self.current.as_ref() else {
            return Err(EngineError::fatal(
                Origin::NullDereference,
                format!("{what} requested without a swapchain"),
            ));
        };
        let items = self.arena.get(span(g)).map_err(arena_fatal)?;
        items.get(index).copied().ok_or_else(|| {
            EngineError::fatal(
                Origin::IndexOutOfBounds,
                format!("{what} {index} >= {}", items.len()),
            )
        })
    }
}

fn fatal(err: DriverError, what: &str) -> EngineError {
    err.into_engine(Severity::Fatal, what)
}

fn arena_fatal(err: ArenaError) -> EngineError {
    err.into_engine(Severity::Fatal)
}

/// Count-then-fill enumeration of formats and present modes into scratch
/// spans, released in reverse order.
fn negotiate<B: Backend>(
    backend: &B,
    scratch: &mut Arena,
    vsync: bool,
) -> Result<(SurfaceFormat, PresentMode), EngineError> {
    let format_count = backend
        .surface_format_count()
        .map_err(|e| fatal(e, "surface format count"))?;
    let mode_count = backend
        .present_mode_count()
        .map_err(|e| fatal(e, "present mode count"))?;

    let formats = scratch
        .allocate::<SurfaceFormat>(format_count)
        .map_err(arena_fatal)?;
    let modes = match scratch.allocate::<PresentMode>(mode_count) {
        Ok(modes) => modes,
        Err(e) => {
            let _ = scratch.deallocate(formats);
            return Err(arena_fatal(e));
        }
    };

    let chosen = fill_and_choose(backend, scratch, formats, modes, vsync);

    scratch.deallocate(modes).map_err(arena_fatal)?;
    scratch.deallocate(formats).map_err(arena_fatal)?;
    chosen
}

fn fill_and_choose<B: Backend>(
    backend: &B,
    scratch: &mut Arena,
    formats: Span<SurfaceFormat>,
    modes: Span<PresentMode>,
    vsync: bool,
) -> Result<(SurfaceFormat, PresentMode), EngineError> {
    let written = backend
        .surface_formats(scratch.get_mut(formats).map_err(arena_fatal)?)
        .map_err(|e| fatal(e, "surface formats"))?;
    let format = {
        let all = scratch.get(formats).map_err(arena_fatal)?;
        choose_surface_format(&all[..written.min(all.len())]).ok_or_else(|| {
            EngineError::fatal(Origin::InitializationFailed, "surface reports no formats")
        })?
    };

    let written = backend
        .present_modes(scratch.get_mut(modes).map_err(arena_fatal)?)
        .map_err(|e| fatal(e, "present modes"))?;
    let all = scratch.get(modes).map_err(arena_fatal)?;
    let mode = choose_present_mode(&all[..written.min(all.len())], vsync);

    Ok((format, mode))
}

fn live<T: crate::GpuHandle>(items: &[T]) -> impl Iterator<Item = T> + '_ {
    items.iter().copied().filter(|h| *h != T::default())
}

// STRICT ORDER: views, semaphores, fences, command buffers, then the swapchain.
fn destroy_generation<B: Backend>(backend: &B, arena: &Arena, g: &Generation<B>) {
    if let Err(e) = destroy_per_image(backend, arena, g) {
        tracing::error!("swapchain teardown skipped per-image objects: {e}");
    }
    if g.handle != <B::Swapchain as Default>::default() {
        backend.destroy_swapchain(g.handle);
    }
}

fn destroy_per_image<B: Backend>(
    backend: &B,
    arena: &Arena,
    g: &Generation<B>,
) -> Result<(), ArenaError> {
    live(arena.get(g.views)?).for_each(|v| backend.destroy_image_view(v));
    live(arena.get(g.render_finished)?).for_each(|s| backend.destroy_semaphore(s));
    live(arena.get(g.image_available)?).for_each(|s| backend.destroy_semaphore(s));
    live(arena.get(g.in_flight)?).for_each(|f| backend.destroy_fence(f));
    let buffers = arena.get(g.command_buffers)?;
    if !buffers.is_empty() && live(buffers).count() == buffers.len() {
        backend.free_command_buffers(buffers);
    }
    Ok(())
}
