// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use ash::khr::{surface, swapchain};
use ash::vk::{self, Handle};
use ash::{Entry, Instance};
use bytemuck::{Pod, Zeroable};
use ember_core::{EngineError, Severity};
use ember_render::backend::{
    Acquired, ColorSpace, DriverError, DriverResult, Format, PresentMode, PresentOutcome,
    QueueFamilies, SubmitBatch, SurfaceCaps, SurfaceFormat, SwapchainDesc,
};
use ember_render::{Backend, EngineConfig, FrameTarget, RenderSize};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

use crate::bootstrap::{bootstrap, DebugMessenger};

macro_rules! handles {
    ($($name:ident => $vk:ty;)*) => {$(
        #[repr(transparent)]
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
        pub struct $name(pub u64);

        impl $name {
            #[inline]
            pub fn raw(self) -> $vk {
                <$vk>::from_raw(self.0)
            }
        }

        impl From<$vk> for $name {
            #[inline]
            fn from(handle: $vk) -> Self {
                Self(handle.as_raw())
            }
        }
    )*};
}

handles! {
    Swapchain => vk::SwapchainKHR;
    Image => vk::Image;
    ImageView => vk::ImageView;
    Semaphore => vk::Semaphore;
    Fence => vk::Fence;
    CommandBuffer => vk::CommandBuffer;
}

/// Host-visible upload source, released once the copy has executed.
#[derive(Debug)]
pub struct Staging {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    memory: vk::DeviceMemory,
}

#[derive(Clone, Copy)]
struct Queues {
    graphics: vk::Queue,
    transfer: vk::Queue,
    present: vk::Queue,
}

static WAIT_STAGE: [vk::PipelineStageFlags; 1] = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub(crate) fn driver(err: vk::Result) -> DriverError {
    match err {
        vk::Result::ERROR_OUT_OF_DATE_KHR => DriverError::OutOfDate,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => DriverError::Timeout,
        other => DriverError::Failed(other.as_raw()),
    }
}

fn nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn size_from(extent: vk::Extent2D) -> RenderSize {
    RenderSize::new(extent.width, extent.height)
}

pub struct VkBackend {
    // kept for the lifetime of the instance
    _entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    phys: vk::PhysicalDevice,
    memory: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    families: QueueFamilies,
    queues: Mutex<Queues>,

    frame_pool: vk::CommandPool,
    one_shot_pool: Mutex<vk::CommandPool>,
    max_samples: vk::SampleCountFlags,
    device_name: String,
}

impl VkBackend {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        cfg: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let boot = unsafe { bootstrap(window, display, cfg)? };
        let families = boot.families;

        let (queues, memory, swapchain_loader) = unsafe {
            (
                Queues {
                    graphics: boot.device.get_device_queue(families.graphics, 0),
                    transfer: boot.device.get_device_queue(families.transfer, 0),
                    present: boot.device.get_device_queue(families.present, 0),
                },
                boot.instance.get_physical_device_memory_properties(boot.phys),
                swapchain::Device::new(&boot.instance, &boot.device),
            )
        };

        // pools start null so Drop can clean up a half-built backend
        let mut backend = VkBackend {
            _entry: boot.entry,
            instance: boot.instance,
            debug: boot.debug,
            surface_loader: boot.surface_loader,
            surface: boot.surface,
            phys: boot.phys,
            memory,
            device: boot.device,
            swapchain_loader,
            families,
            queues: Mutex::new(queues),
            frame_pool: vk::CommandPool::null(),
            one_shot_pool: Mutex::new(vk::CommandPool::null()),
            max_samples: boot.max_samples,
            device_name: boot.device_name,
        };

        backend.frame_pool = backend
            .create_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .map_err(|e| e.into_engine(Severity::Fatal, "create frame command pool"))?;
        let one_shot = backend
            .create_pool(vk::CommandPoolCreateFlags::TRANSIENT)
            .map_err(|e| e.into_engine(Severity::Fatal, "create one-shot command pool"))?;
        *backend.one_shot_pool.get_mut() = one_shot;

        info!("vk: backend ready on `{}`", backend.device_name);
        Ok(backend)
    }

    fn create_pool(&self, flags: vk::CommandPoolCreateFlags) -> DriverResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: self.families.graphics,
            flags,
            ..Default::default()
        };
        unsafe { self.device.create_command_pool(&pool_info, None) }.map_err(driver)
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.queues.lock().transfer
    }

    /// Highest sample count usable for color and depth targets alike.
    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.max_samples
    }

    fn find_memory_type(&self, type_bits: u32, req: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory.memory_types[i as usize]
                    .property_flags
                    .contains(req)
        })
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> DriverResult<(vk::Buffer, vk::DeviceMemory)> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buf = self.device.create_buffer(&bci, None).map_err(driver)?;
            let req = self.device.get_buffer_memory_requirements(buf);
            let Some(mem_type) = self.find_memory_type(req.memory_type_bits, props) else {
                self.device.destroy_buffer(buf, None);
                return Err(driver(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            };
            let mai = vk::MemoryAllocateInfo {
                s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                allocation_size: req.size,
                memory_type_index: mem_type,
                ..Default::default()
            };
            let mem = match self.device.allocate_memory(&mai, None) {
                Ok(mem) => mem,
                Err(e) => {
                    self.device.destroy_buffer(buf, None);
                    return Err(driver(e));
                }
            };
            if let Err(e) = self.device.bind_buffer_memory(buf, mem, 0) {
                self.device.destroy_buffer(buf, None);
                self.device.free_memory(mem, None);
                return Err(driver(e));
            }
            Ok((buf, mem))
        }
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
            self.device.free_memory(memory, None);
        }
    }

    /// Host-visible copy of `data`, ready to be the source of a transfer.
    pub fn create_staging(&self, data: &[u8]) -> DriverResult<Staging> {
        let size = data.len() as vk::DeviceSize;
        let (buffer, memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let staging = Staging {
            buffer,
            size,
            memory,
        };
        unsafe {
            match self
                .device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            {
                Ok(ptr) => {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
                    self.device.unmap_memory(memory);
                    Ok(staging)
                }
                Err(e) => {
                    self.release_staging(staging);
                    Err(driver(e))
                }
            }
        }
    }

    /// Allocates a one-shot buffer from the transient pool and starts it.
    pub fn begin_one_shot(&self) -> DriverResult<CommandBuffer> {
        let pool = self.one_shot_pool.lock();
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: *pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(&ai)
                .map_err(driver)?
                .first()
                .copied()
                .ok_or(DriverError::Failed(vk::Result::ERROR_UNKNOWN.as_raw()))?;
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            if let Err(e) = self.device.begin_command_buffer(cmd, &bi) {
                self.device
                    .free_command_buffers(*pool, std::slice::from_ref(&cmd));
                return Err(driver(e));
            }
            Ok(cmd.into())
        }
    }

    // The one-shot pool is externally synchronized: every call that records
    // into, ends or frees one of its buffers holds the pool lock.
    pub fn end_one_shot(&self, buffer: CommandBuffer) -> DriverResult<()> {
        let _pool = self.one_shot_pool.lock();
        unsafe { self.device.end_command_buffer(buffer.raw()) }.map_err(driver)
    }

    pub fn record_buffer_copy(&self, buffer: CommandBuffer, src: &Staging, dst: vk::Buffer) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        let _pool = self.one_shot_pool.lock();
        unsafe {
            self.device.cmd_copy_buffer(
                buffer.raw(),
                src.buffer,
                dst,
                std::slice::from_ref(&region),
            );
        }
    }

    /// Records a full-target clear with dynamic rendering, leaving the
    /// image ready to present.
    pub fn record_clear(&self, target: &FrameTarget<Self>, rgba: [f32; 4]) {
        let cmd = target.command_buffer.raw();
        let image = target.image.raw();
        unsafe {
            self.image_barrier(
                cmd,
                image,
                (
                    vk::PipelineStageFlags2::TOP_OF_PIPE,
                    vk::AccessFlags2::empty(),
                    vk::ImageLayout::UNDEFINED,
                ),
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
            );

            let color_att = vk::RenderingAttachmentInfo {
                s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
                image_view: target.image_view.raw(),
                image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32: rgba },
                },
                ..Default::default()
            };
            let rendering_info = vk::RenderingInfo {
                s_type: vk::StructureType::RENDERING_INFO,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: target.extent.width,
                        height: target.extent.height,
                    },
                },
                layer_count: 1,
                color_attachment_count: 1,
                p_color_attachments: &color_att,
                ..Default::default()
            };
            self.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.cmd_end_rendering(cmd);

            self.image_barrier(
                cmd,
                image,
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                (
                    vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                    vk::AccessFlags2::empty(),
                    vk::ImageLayout::PRESENT_SRC_KHR,
                ),
            );
        }
    }

    #[inline]
    unsafe fn image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout),
    ) {
        let barrier = vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: src.0,
            src_access_mask: src.1,
            dst_stage_mask: dst.0,
            dst_access_mask: dst.1,
            old_layout: src.2,
            new_layout: dst.2,
            image,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        let dep = vk::DependencyInfo {
            s_type: vk::StructureType::DEPENDENCY_INFO,
            image_memory_barrier_count: 1,
            p_image_memory_barriers: &barrier,
            ..Default::default()
        };
        self.device.cmd_pipeline_barrier2(cmd, &dep);
    }
}

// STRICT TEARDOWN ORDER:
// - Swapchain, views and sync objects are gone already (FrameEngine drops first)
// - device_wait_idle()
// - Destroy command pools BEFORE device (frees their buffers)
// - Destroy device, then surface, then debug messenger; instance last.
impl Drop for VkBackend {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device
                .destroy_command_pool(*self.one_shot_pool.get_mut(), None);
            self.device.destroy_command_pool(self.frame_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
        info!("vk: backend destroyed");
    }
}

struct RawBatch {
    wait: Vec<vk::Semaphore>,
    buffers: Vec<vk::CommandBuffer>,
    signal: Vec<vk::Semaphore>,
}

impl Backend for VkBackend {
    type Swapchain = Swapchain;
    type Image = Image;
    type ImageView = ImageView;
    type Semaphore = Semaphore;
    type Fence = Fence;
    type CommandBuffer = CommandBuffer;
    type Staging = Staging;

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn surface_capabilities(&self) -> DriverResult<SurfaceCaps> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
        }
        .map_err(driver)?;
        Ok(SurfaceCaps {
            current_extent: size_from(caps.current_extent),
            min_extent: size_from(caps.min_image_extent),
            max_extent: size_from(caps.max_image_extent),
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
        })
    }

    fn surface_format_count(&self) -> DriverResult<usize> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.phys, self.surface)
        }
        .map(|formats| formats.len())
        .map_err(driver)
    }

    fn surface_formats(&self, out: &mut [SurfaceFormat]) -> DriverResult<usize> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.phys, self.surface)
        }
        .map_err(driver)?;
        for (slot, f) in out.iter_mut().zip(&formats) {
            *slot = SurfaceFormat {
                format: Format(f.format.as_raw()),
                color_space: ColorSpace(f.color_space.as_raw()),
            };
        }
        Ok(formats.len().min(out.len()))
    }

    fn present_mode_count(&self) -> DriverResult<usize> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.phys, self.surface)
        }
        .map(|modes| modes.len())
        .map_err(driver)
    }

    fn present_modes(&self, out: &mut [PresentMode]) -> DriverResult<usize> {
        let modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.phys, self.surface)
        }
        .map_err(driver)?;
        for (slot, m) in out.iter_mut().zip(&modes) {
            *slot = PresentMode(m.as_raw());
        }
        Ok(modes.len().min(out.len()))
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: Swapchain) -> DriverResult<Swapchain> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
        }
        .map_err(driver)?;

        // Prefer IDENTITY if supported, otherwise use current to avoid extra blits.
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let shared = [desc.families.graphics, desc.families.present];
        let (sharing_mode, family_indices): (_, &[u32]) = if desc.families.split_present() {
            (vk::SharingMode::CONCURRENT, &shared)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count: desc.image_count,
            image_format: vk::Format::from_raw(desc.format.format.0),
            image_color_space: vk::ColorSpaceKHR::from_raw(desc.format.color_space.0),
            image_extent: vk::Extent2D {
                width: desc.extent.width,
                height: desc.extent.height,
            },
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: vk::PresentModeKHR::from_raw(desc.present_mode.0),
            clipped: vk::TRUE,
            old_swapchain: old.raw(),
            ..Default::default()
        };

        unsafe { self.swapchain_loader.create_swapchain(&swap_info, None) }
            .map(Swapchain::from)
            .map_err(driver)
    }

    fn destroy_swapchain(&self, swapchain: Swapchain) {
        unsafe {
            self.swapchain_loader
                .destroy_swapchain(swapchain.raw(), None);
        }
    }

    fn swapchain_image_count(&self, swapchain: Swapchain) -> DriverResult<usize> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain.raw()) }
            .map(|images| images.len())
            .map_err(driver)
    }

    fn swapchain_images(&self, swapchain: Swapchain, out: &mut [Image]) -> DriverResult<()> {
        let images =
            unsafe { self.swapchain_loader.get_swapchain_images(swapchain.raw()) }.map_err(driver)?;
        if images.len() != out.len() {
            return Err(DriverError::Failed(vk::Result::INCOMPLETE.as_raw()));
        }
        for (slot, &image) in out.iter_mut().zip(&images) {
            *slot = image.into();
        }
        Ok(())
    }

    fn create_image_view(&self, image: Image, format: Format) -> DriverResult<ImageView> {
        // View format MUST match swapchain image format for direct rendering.
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: image.raw(),
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk::Format::from_raw(format.0),
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&iv_info, None) }
            .map(ImageView::from)
            .map_err(driver)
    }

    fn destroy_image_view(&self, view: ImageView) {
        unsafe { self.device.destroy_image_view(view.raw(), None) }
    }

    fn create_semaphore(&self) -> DriverResult<Semaphore> {
        let sem_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&sem_info, None) }
            .map(Semaphore::from)
            .map_err(driver)
    }

    fn destroy_semaphore(&self, semaphore: Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore.raw(), None) }
    }

    fn create_fence(&self) -> DriverResult<Fence> {
        let fence_info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&fence_info, None) }
            .map(Fence::from)
            .map_err(driver)
    }

    fn destroy_fence(&self, fence: Fence) {
        unsafe { self.device.destroy_fence(fence.raw(), None) }
    }

    fn wait_fence(&self, fence: Fence, timeout: Duration) -> DriverResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence.raw()], true, nanos(timeout))
        }
        .map_err(driver)
    }

    fn reset_fence(&self, fence: Fence) -> DriverResult<()> {
        unsafe { self.device.reset_fences(&[fence.raw()]) }.map_err(driver)
    }

    fn allocate_command_buffers(&self, out: &mut [CommandBuffer]) -> DriverResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.frame_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: out.len() as u32,
            ..Default::default()
        };
        let bufs = unsafe { self.device.allocate_command_buffers(&alloc_info) }.map_err(driver)?;
        for (slot, &cmd) in out.iter_mut().zip(&bufs) {
            *slot = cmd.into();
        }
        Ok(())
    }

    fn free_command_buffers(&self, buffers: &[CommandBuffer]) {
        let bufs: Vec<vk::CommandBuffer> = buffers.iter().map(|b| b.raw()).collect();
        if !bufs.is_empty() {
            unsafe { self.device.free_command_buffers(self.frame_pool, &bufs) }
        }
    }

    fn free_one_shot(&self, buffer: CommandBuffer) {
        let pool = self.one_shot_pool.lock();
        unsafe {
            self.device
                .free_command_buffers(*pool, std::slice::from_ref(&buffer.raw()));
        }
    }

    fn begin_command_buffer(&self, buffer: CommandBuffer) -> DriverResult<()> {
        let cmd = buffer.raw();
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(driver)?;
            self.device.begin_command_buffer(cmd, &begin).map_err(driver)
        }
    }

    fn end_command_buffer(&self, buffer: CommandBuffer) -> DriverResult<()> {
        unsafe { self.device.end_command_buffer(buffer.raw()) }.map_err(driver)
    }

    fn submit(&self, batches: &[SubmitBatch<'_, Self>], fence: Option<Fence>) -> DriverResult<()> {
        let raw: Vec<RawBatch> = batches
            .iter()
            .map(|b| RawBatch {
                wait: b.wait.iter().map(|s| s.raw()).collect(),
                buffers: b.command_buffers.iter().map(|c| c.raw()).collect(),
                signal: b.signal.iter().map(|s| s.raw()).collect(),
            })
            .collect();
        let infos: Vec<vk::SubmitInfo> = raw
            .iter()
            .map(|b| vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                wait_semaphore_count: b.wait.len() as u32,
                p_wait_semaphores: b.wait.as_ptr(),
                p_wait_dst_stage_mask: WAIT_STAGE.as_ptr(),
                command_buffer_count: b.buffers.len() as u32,
                p_command_buffers: b.buffers.as_ptr(),
                signal_semaphore_count: b.signal.len() as u32,
                p_signal_semaphores: b.signal.as_ptr(),
                ..Default::default()
            })
            .collect();

        let queues = self.queues.lock();
        unsafe {
            self.device.queue_submit(
                queues.graphics,
                &infos,
                fence.map_or(vk::Fence::null(), Fence::raw),
            )
        }
        .map_err(driver)
    }

    fn acquire_next_image(
        &self,
        swapchain: Swapchain,
        signal: Semaphore,
        timeout: Duration,
    ) -> DriverResult<Acquired> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain.raw(),
                nanos(timeout),
                signal.raw(),
                vk::Fence::null(),
            )
        }
        .map(|(index, suboptimal)| Acquired { index, suboptimal })
        .map_err(driver)
    }

    fn present(
        &self,
        swapchain: Swapchain,
        image_index: u32,
        wait: Semaphore,
    ) -> DriverResult<PresentOutcome> {
        let wait = wait.raw();
        let swapchain = swapchain.raw();
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let queues = self.queues.lock();
        match unsafe { self.swapchain_loader.queue_present(queues.present, &present) } {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(e) => Err(driver(e)),
        }
    }

    fn wait_graphics_idle(&self) -> DriverResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(driver)
    }

    fn transition_to_present(&self, images: &[Image]) -> DriverResult<()> {
        if images.is_empty() {
            return Ok(());
        }
        let cmd = self.begin_one_shot()?;
        let pool = self.one_shot_pool.lock();
        unsafe {
            for image in images {
                self.image_barrier(
                    cmd.raw(),
                    image.raw(),
                    (
                        vk::PipelineStageFlags2::TOP_OF_PIPE,
                        vk::AccessFlags2::empty(),
                        vk::ImageLayout::UNDEFINED,
                    ),
                    (
                        vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                        vk::AccessFlags2::empty(),
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    ),
                );
            }
        }
        drop(pool);
        let result = self.end_one_shot(cmd).and_then(|()| {
            let raw = cmd.raw();
            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &raw,
                ..Default::default()
            };
            let queues = self.queues.lock();
            unsafe {
                self.device
                    .queue_submit(queues.graphics, std::slice::from_ref(&si), vk::Fence::null())
                    .and_then(|()| self.device.queue_wait_idle(queues.graphics))
            }
            .map_err(driver)
        });
        self.free_one_shot(cmd);
        result
    }

    fn release_staging(&self, staging: Staging) {
        self.destroy_buffer(staging.buffer, staging.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        assert_eq!(driver(vk::Result::ERROR_OUT_OF_DATE_KHR), DriverError::OutOfDate);
        assert_eq!(driver(vk::Result::TIMEOUT), DriverError::Timeout);
        assert_eq!(driver(vk::Result::NOT_READY), DriverError::Timeout);
        assert_eq!(
            driver(vk::Result::ERROR_DEVICE_LOST),
            DriverError::Failed(vk::Result::ERROR_DEVICE_LOST.as_raw())
        );
    }

    #[test]
    fn test_null_handles_map_to_default() {
        assert_eq!(Fence::from(vk::Fence::null()), Fence::default());
        assert_eq!(Swapchain::default().raw(), vk::SwapchainKHR::null());
        assert_eq!(Fence(42).raw().as_raw(), 42);
    }

    #[test]
    fn test_backend_can_be_shared_with_producers() {
        fn shared<T: Send + Sync>() {}
        shared::<VkBackend>();
        shared::<Staging>();
        shared::<ember_render::UploadQueue<VkBackend>>();
    }

    #[test]
    fn test_timeout_saturates() {
        assert_eq!(nanos(Duration::from_millis(2)), 2_000_000);
        assert_eq!(nanos(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_format_values_match_vulkan() {
        assert_eq!(Format::B8G8R8A8_SRGB.0, vk::Format::B8G8R8A8_SRGB.as_raw());
        assert_eq!(Format::B8G8R8A8_UNORM.0, vk::Format::B8G8R8A8_UNORM.as_raw());
        assert_eq!(PresentMode::MAILBOX.0, vk::PresentModeKHR::MAILBOX.as_raw());
        assert_eq!(PresentMode::FIFO.0, vk::PresentModeKHR::FIFO.as_raw());
        assert_eq!(
            ColorSpace::SRGB_NONLINEAR.0,
            vk::ColorSpaceKHR::SRGB_NONLINEAR.as_raw()
        );
    }
}
