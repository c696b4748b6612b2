// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use anyhow::{Context, Result};
use winit::{
    dpi::PhysicalSize,
    event_loop::ActiveEventLoop,
    window::{Window, WindowAttributes},
};

/// Creates the main window; the framebuffer size is read back right away.
pub fn create_window(event_loop: &ActiveEventLoop, title: &str) -> Result<Window> {
    let window = event_loop
        .create_window(WindowAttributes::default().with_title(title))
        .context("create_window")?;
    let PhysicalSize { width, height } = window.inner_size();
    tracing::info!("window `{title}` created ({width}x{height})");
    Ok(window)
}

/// Pixel size of the window's drawable area; `(0, 0)` while minimized.
pub fn framebuffer_size(window: &Window) -> (u32, u32) {
    if window.is_minimized() == Some(true) {
        return (0, 0);
    }
    let size = window.inner_size();
    (size.width, size.height)
}
