// SPDX-License-Identifier: CEPL-1.0
mod backend;
mod bootstrap;
mod renderer;

pub use ash::vk;
pub use backend::{CommandBuffer, Fence, Image, ImageView, Semaphore, Staging, Swapchain, VkBackend};
pub use renderer::VkRenderer;
