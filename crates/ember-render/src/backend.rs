// SPDX-License-Identifier: CEPL-1.0
//! The driver surface the frame protocol is written against.

use std::fmt::Debug;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use ember_core::{EngineError, Origin, Severity};
use thiserror::Error;

use crate::RenderSize;

pub trait GpuHandle: Pod + Default + PartialEq + Debug + Send + Sync {}

impl<T> GpuHandle for T where T: Pod + Default + PartialEq + Debug + Send + Sync {}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Format(pub i32);

impl Format {
    pub const UNDEFINED: Format = Format(0);
    pub const R8G8B8A8_UNORM: Format = Format(37);
    pub const R8G8B8A8_SRGB: Format = Format(43);
    pub const B8G8R8A8_UNORM: Format = Format(44);
    pub const B8G8R8A8_SRGB: Format = Format(50);

    pub fn name(self) -> &'static str {
        match self {
            Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
            Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
            Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
            Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
            _ => "OTHER",
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ColorSpace(pub i32);

impl ColorSpace {
    pub const SRGB_NONLINEAR: ColorSpace = ColorSpace(0);
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct SurfaceFormat {
    pub format: Format,
    pub color_space: ColorSpace,
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PresentMode(pub i32);

impl PresentMode {
    pub const IMMEDIATE: PresentMode = PresentMode(0);
    pub const MAILBOX: PresentMode = PresentMode(1);
    /// The only mode every surface supports.
    pub const FIFO: PresentMode = PresentMode(2);
    pub const FIFO_RELAXED: PresentMode = PresentMode(3);

    pub fn name(self) -> &'static str {
        match self {
            PresentMode::FIFO => "FIFO",
            PresentMode::MAILBOX => "MAILBOX",
            PresentMode::IMMEDIATE => "IMMEDIATE",
            PresentMode::FIFO_RELAXED => "FIFO_RELAXED",
            _ => "OTHER",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceCaps {
    /// [`RenderSize::UNDEFINED`] when the surface lets the swapchain pick.
    pub current_extent: RenderSize,
    pub min_extent: RenderSize,
    pub max_extent: RenderSize,
    pub min_image_count: u32,
    /// 0 means no upper bound.
    pub max_image_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Swapchain images need concurrent sharing when this is true.
    #[inline]
    pub fn split_present(&self) -> bool {
        self.graphics != self.present
    }

    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for family in [self.graphics, self.transfer, self.present] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: RenderSize,
    pub image_count: u32,
    pub families: QueueFamilies,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub index: u32,
    pub suboptimal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("surface is out of date")]
    OutOfDate,
    #[error("timed out")]
    Timeout,
    #[error("driver call failed (code {0})")]
    Failed(i32),
}

impl DriverError {
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::Failed(code) => Some(*code),
            _ => None,
        }
    }

    /// `what` names the failed operation, e.g. `"acquire"`.
    pub fn into_engine(self, severity: Severity, what: &str) -> EngineError {
        EngineError::new(severity, Origin::DriverError, format!("{what}: {self}"))
            .with_code(self.code())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// One batch of a queue submission.
///
/// `wait` is waited at the color-attachment-output stage.
pub struct SubmitBatch<'a, B: Backend + ?Sized> {
    pub wait: Option<B::Semaphore>,
    pub command_buffers: &'a [B::CommandBuffer],
    pub signal: Option<B::Semaphore>,
}

pub trait Backend {
    type Swapchain: GpuHandle;
    type Image: GpuHandle;
    type ImageView: GpuHandle;
    type Semaphore: GpuHandle;
    type Fence: GpuHandle;
    type CommandBuffer: GpuHandle;
    /// Host-visible resource kept alive until an upload has executed.
    type Staging: Send + 'static;

    fn queue_families(&self) -> QueueFamilies;

    fn surface_capabilities(&self) -> DriverResult<SurfaceCaps>;
    fn surface_format_count(&self) -> DriverResult<usize>;
    /// Fills `out`, returns how many entries were written.
    fn surface_formats(&self, out: &mut [SurfaceFormat]) -> DriverResult<usize>;
    fn present_mode_count(&self) -> DriverResult<usize>;
    fn present_modes(&self, out: &mut [PresentMode]) -> DriverResult<usize>;

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Self::Swapchain,
    ) -> DriverResult<Self::Swapchain>;
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);
    fn swapchain_image_count(&self, swapchain: Self::Swapchain) -> DriverResult<usize>;
    fn swapchain_images(
        &self,
        swapchain: Self::Swapchain,
        out: &mut [Self::Image],
    ) -> DriverResult<()>;

    fn create_image_view(&self, image: Self::Image, format: Format)
        -> DriverResult<Self::ImageView>;
    fn destroy_image_view(&self, view: Self::ImageView);

    fn create_semaphore(&self) -> DriverResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    /// Fences start unsignaled.
    fn create_fence(&self) -> DriverResult<Self::Fence>;
    fn destroy_fence(&self, fence: Self::Fence);
    fn wait_fence(&self, fence: Self::Fence, timeout: Duration) -> DriverResult<()>;
    fn reset_fence(&self, fence: Self::Fence) -> DriverResult<()>;

    /// Per-frame primary command buffers.
    fn allocate_command_buffers(&self, out: &mut [Self::CommandBuffer]) -> DriverResult<()>;
    fn free_command_buffers(&self, buffers: &[Self::CommandBuffer]);
    /// Frees a one-shot buffer handed in through the deferred queue.
    fn free_one_shot(&self, buffer: Self::CommandBuffer);
    /// Resets the buffer and starts recording.
    fn begin_command_buffer(&self, buffer: Self::CommandBuffer) -> DriverResult<()>;
    fn end_command_buffer(&self, buffer: Self::CommandBuffer) -> DriverResult<()>;

    /// One call, any number of batches, one optional fence for all of them.
    /// An empty `batches` slice only signals the fence.
    fn submit(
        &self,
        batches: &[SubmitBatch<'_, Self>],
        fence: Option<Self::Fence>,
    ) -> DriverResult<()>;

    fn acquire_next_image(
        &self,
        swapchain: Self::Swapchain,
        signal: Self::Semaphore,
        timeout: Duration,
    ) -> DriverResult<Acquired>;
    fn present(
        &self,
        swapchain: Self::Swapchain,
        image_index: u32,
        wait: Self::Semaphore,
    ) -> DriverResult<PresentOutcome>;

    fn wait_graphics_idle(&self) -> DriverResult<()>;

    /// Records and submits a one-shot transition of `images` from the
    /// undefined layout to the present layout, and waits for it.
    fn transition_to_present(&self, images: &[Self::Image]) -> DriverResult<()>;

    fn release_staging(&self, staging: Self::Staging);
}
