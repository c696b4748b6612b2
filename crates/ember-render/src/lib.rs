// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ember_core::{EngineError, ErrorSink};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod backend;
pub mod config;
pub mod frame;
pub mod select;
pub mod swapchain;
pub mod upload;

pub use backend::{Backend, DriverError, DriverResult, GpuHandle};
pub use config::EngineConfig;
pub use frame::{FrameEngine, FrameOutcome, FramePhase, FrameStatus, FrameTarget};
pub use swapchain::{Swapchain, SwapchainState};
pub use upload::{DeferredCommand, DeferredFlags, PushError, SubmitAction, UploadQueue};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    /// Sentinel a surface reports when the swapchain decides its own extent.
    pub const UNDEFINED: RenderSize = RenderSize {
        width: u32::MAX,
        height: u32::MAX,
    };

    pub const ZERO: RenderSize = RenderSize {
        width: 0,
        height: 0,
    };

    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Minimized windows report a zero dimension.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &EngineConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self, EngineError>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<(), EngineError>;
    fn render(&mut self) -> Result<FrameOutcome, EngineError>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) -> Result<(), EngineError> {
        Ok(())
    }
}
