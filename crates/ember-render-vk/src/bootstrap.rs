// SPDX-License-Identifier: CEPL-1.0
// STRICT ORDER:
// 1) Create VkInstance (platform WSI extensions, optional validation)
// 2) Create VkSurfaceKHR FROM THIS INSTANCE
// 3) Describe physical devices AGAINST THIS SURFACE (present support)
// 4) Create VkDevice with the features the selection required
// Changing this order => surface may be incompatible with chosen device/queue.

use std::ffi::{c_char, CStr, CString};

use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use ember_core::{EngineError, Origin, Severity};
use ember_render::backend::QueueFamilies;
use ember_render::select::{
    missing_extensions, select_device, DeviceCandidate, DeviceFeatures, DeviceKind,
    QueueFamilyInfo,
};
use ember_render::EngineConfig;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{info, warn};

use crate::backend::driver;

const ENGINE_NAME: &CStr = c"ember";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const KHR_RENDERING: [&CStr; 2] = [
    ash::khr::synchronization2::NAME,
    ash::khr::dynamic_rendering::NAME,
];

/// How dynamic rendering and synchronization2 reach the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RenderPath {
    Core13,
    KhrExt,
    Legacy,
}

struct Physical {
    handle: vk::PhysicalDevice,
    path: RenderPath,
}

pub(crate) struct DebugMessenger {
    loader: ext_debug::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub(crate) unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

/// Everything device-level the backend is built from.
pub(crate) struct Bootstrap {
    pub entry: Entry,
    pub instance: Instance,
    pub debug: Option<DebugMessenger>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub families: QueueFamilies,
    pub max_samples: vk::SampleCountFlags,
    pub device_name: String,
}

fn init_failed(message: impl Into<String>) -> EngineError {
    EngineError::fatal(Origin::InitializationFailed, message)
}

fn vk_fatal(err: vk::Result, what: &str) -> EngineError {
    driver(err).into_engine(Severity::Fatal, what)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", "{msg}");
    } else {
        tracing::trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<DebugMessenger, vk::Result> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader.create_debug_utils_messenger(&ci, None)?;
    Ok(DebugMessenger { loader, messenger })
}

/// Validation needs both the layer and the debug-utils extension.
unsafe fn validation_available(entry: &Entry, available_exts: &[&CStr]) -> bool {
    let layers = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default();
    let has_layer = layers
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
    has_layer && available_exts.contains(&ext_debug::NAME)
}

/// Returns the instance and whether validation ended up enabled.
unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    cfg: &EngineConfig,
) -> Result<(Instance, bool), EngineError> {
    let app = CString::new(cfg.app_name.as_str())
        .map_err(|_| init_failed("app_name contains a NUL byte"))?;
    let [major, minor, patch] = cfg.app_version;

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: vk::make_api_version(0, major, minor, patch),
        p_engine_name: ENGINE_NAME.as_ptr(),
        engine_version: vk::make_api_version(0, 0, 1, 0),
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let required = ash_window::enumerate_required_extensions(display_raw)
        .map_err(|e| vk_fatal(e, "enumerate required extensions"))?;
    let inst_exts = entry
        .enumerate_instance_extension_properties(None)
        .map_err(|e| vk_fatal(e, "enumerate instance extensions"))?;
    let available: Vec<&CStr> = inst_exts
        .iter()
        .filter_map(|e| e.extension_name_as_c_str().ok())
        .collect();

    let required_names: Vec<&CStr> = required.iter().map(|&p| CStr::from_ptr(p)).collect();
    let missing = missing_extensions(&required_names, &available);
    if !missing.is_empty() {
        return Err(init_failed(format!(
            "missing instance extensions: {missing:?}"
        )));
    }

    let mut ext_vec: Vec<*const c_char> = required.to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();
    let validation = cfg.validation && validation_available(entry, &available);
    if validation {
        ext_vec.push(ext_debug::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    } else if cfg.validation {
        warn!("{VALIDATION_LAYER:?} unavailable, continuing without validation");
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(|e| vk_fatal(e, "create instance"))?;
    Ok((instance, validation))
}

unsafe fn query_features(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    path: RenderPath,
) -> DeviceFeatures {
    let mut feats13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut feats_sync2_khr = vk::PhysicalDeviceSynchronization2FeaturesKHR::default();
    let mut feats_dr_khr = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default();
    let mut feats2 = vk::PhysicalDeviceFeatures2::default();

    match path {
        RenderPath::Core13 => {
            feats2.p_next = (&mut feats13) as *mut _ as *mut _;
        }
        RenderPath::KhrExt => {
            feats_sync2_khr.p_next = (&mut feats_dr_khr) as *mut _ as *mut _;
            feats2.p_next = (&mut feats_sync2_khr) as *mut _ as *mut _;
        }
        RenderPath::Legacy => {}
    }
    instance.get_physical_device_features2(phys, &mut feats2);

    let dynamic_rendering = match path {
        RenderPath::Core13 => {
            feats13.dynamic_rendering == vk::TRUE && feats13.synchronization2 == vk::TRUE
        }
        RenderPath::KhrExt => {
            feats_dr_khr.dynamic_rendering == vk::TRUE
                && feats_sync2_khr.synchronization2 == vk::TRUE
        }
        RenderPath::Legacy => false,
    };

    DeviceFeatures {
        sampler_anisotropy: feats2.features.sampler_anisotropy == vk::TRUE,
        fill_mode_non_solid: feats2.features.fill_mode_non_solid == vk::TRUE,
        dynamic_rendering,
    }
}

fn device_kind(ty: vk::PhysicalDeviceType) -> DeviceKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Virtual,
        vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
        _ => DeviceKind::Other,
    }
}

unsafe fn describe(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Result<(DeviceCandidate, RenderPath), vk::Result> {
    let props = instance.get_physical_device_properties(phys);
    let name = props
        .device_name_as_c_str()
        .map_or_else(|_| "<unnamed>".to_owned(), |n| n.to_string_lossy().into_owned());

    let ext_props = instance.enumerate_device_extension_properties(phys)?;
    let exts: Vec<&CStr> = ext_props
        .iter()
        .filter_map(|e| e.extension_name_as_c_str().ok())
        .collect();

    let maj = vk::api_version_major(props.api_version);
    let min = vk::api_version_minor(props.api_version);
    let path = if maj > 1 || (maj == 1 && min >= 3) {
        RenderPath::Core13
    } else if missing_extensions(&KHR_RENDERING, &exts).is_empty() {
        RenderPath::KhrExt
    } else {
        RenderPath::Legacy
    };

    // without VK_KHR_swapchain the surface is unusable, report no formats
    let (surface_format_count, present_mode_count) =
        if missing_extensions(&[swapchain::NAME], &exts).is_empty() {
            (
                surf_i
                    .get_physical_device_surface_formats(phys, surface)?
                    .len(),
                surf_i
                    .get_physical_device_surface_present_modes(phys, surface)?
                    .len(),
            )
        } else {
            (0, 0)
        };

    let queue_families = instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .map(|(i, q)| QueueFamilyInfo {
            queue_count: q.queue_count,
            graphics: q.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: q.queue_flags.contains(vk::QueueFlags::COMPUTE),
            transfer: q.queue_flags.contains(vk::QueueFlags::TRANSFER),
            present: surf_i
                .get_physical_device_surface_support(phys, i as u32, surface)
                .unwrap_or(false),
        })
        .collect();

    let candidate = DeviceCandidate {
        name,
        kind: device_kind(props.device_type),
        surface_format_count,
        present_mode_count,
        features: query_features(instance, phys, path),
        queue_families,
        color_samples: props.limits.framebuffer_color_sample_counts.as_raw(),
        depth_samples: props.limits.framebuffer_depth_sample_counts.as_raw(),
    };
    Ok((candidate, path))
}

unsafe fn gather_candidates(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(Vec<DeviceCandidate>, Vec<Physical>), EngineError> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(|e| vk_fatal(e, "enumerate physical devices"))?;

    let mut candidates = Vec::with_capacity(devices.len());
    let mut physicals = Vec::with_capacity(devices.len());
    for handle in devices {
        match describe(instance, surf_i, surface, handle) {
            Ok((candidate, path)) => {
                candidates.push(candidate);
                physicals.push(Physical { handle, path });
            }
            Err(e) => warn!("skipping physical device: {e}"),
        }
    }
    Ok((candidates, physicals))
}

unsafe fn create_device(
    instance: &Instance,
    phys: &Physical,
    families: QueueFamilies,
) -> Result<ash::Device, EngineError> {
    // STRICT ORDER (feature pNext chain):
    // Core 1.3 path: feats13 -> chained after feats2
    // KHR path:      feats_sync2_khr -> feats_dr_khr, chained after feats2
    // DO NOT MIX core 1.3 structs with KHR equivalents in the same chain.

    let priorities = [1.0_f32];
    let unique = families.unique();
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique
        .iter()
        .map(|&family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let mut device_exts: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];

    let mut feats13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut feats_sync2_khr = vk::PhysicalDeviceSynchronization2FeaturesKHR::default();
    let mut feats_dr_khr = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default();
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        features: vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            fill_mode_non_solid: vk::TRUE,
            ..Default::default()
        },
        ..Default::default()
    };

    match phys.path {
        RenderPath::Core13 => {
            feats13.synchronization2 = vk::TRUE;
            feats13.dynamic_rendering = vk::TRUE;
            feats2.p_next = (&mut feats13) as *mut _ as *mut _;
        }
        RenderPath::KhrExt => {
            device_exts.extend(KHR_RENDERING.iter().map(|n| n.as_ptr()));
            feats_sync2_khr.synchronization2 = vk::TRUE;
            feats_dr_khr.dynamic_rendering = vk::TRUE;
            feats_sync2_khr.p_next = (&mut feats_dr_khr) as *mut _ as *mut _;
            feats2.p_next = (&mut feats_sync2_khr) as *mut _ as *mut _;
        }
        RenderPath::Legacy => {
            return Err(init_failed(
                "dynamic rendering not available; no render-pass fallback",
            ));
        }
    }

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&mut feats2) as *mut _ as *const _,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    instance
        .create_device(phys.handle, &dinfo, None)
        .map_err(|e| vk_fatal(e, "create device"))
}

struct OpenedDevice {
    phys: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    max_samples: vk::SampleCountFlags,
    name: String,
}

/// Selection and device creation; the caller owns cleanup on failure.
unsafe fn open_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<OpenedDevice, EngineError> {
    let (candidates, physicals) = gather_candidates(instance, surf_i, surface)?;
    let selection = select_device(&candidates)?;
    let (candidate, phys) = match (
        candidates.get(selection.index),
        physicals.get(selection.index),
    ) {
        (Some(c), Some(p)) => (c, p),
        _ => return Err(init_failed("selected device index out of range")),
    };

    let device = create_device(instance, phys, selection.families)?;
    info!(
        "gpu `{}` ({:?}, {:?}) score={} families={:?} msaa<={}",
        candidate.name,
        candidate.kind,
        phys.path,
        selection.score,
        selection.families,
        selection.max_samples
    );
    Ok(OpenedDevice {
        phys: phys.handle,
        device,
        families: selection.families,
        max_samples: vk::SampleCountFlags::from_raw(selection.max_samples),
        name: candidate.name.clone(),
    })
}

pub(crate) unsafe fn bootstrap(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    cfg: &EngineConfig,
) -> Result<Bootstrap, EngineError> {
    // --- Platform handles (can fail on some backends) ---
    let dh = display
        .display_handle()
        .map_err(|e| init_failed(format!("display handle: {e}")))?
        .as_raw();
    let wh = window
        .window_handle()
        .map_err(|e| init_failed(format!("window handle: {e}")))?
        .as_raw();

    let entry = Entry::linked();
    let (instance, validation) = create_instance(&entry, dh, cfg)?;

    let debug = if validation {
        match create_debug_messenger(&entry, &instance) {
            Ok(debug) => Some(debug),
            Err(e) => {
                warn!("debug messenger unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let surface_loader = surface::Instance::new(&entry, &instance);
    let opened = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
        Ok(surface) => match open_device(&instance, &surface_loader, surface) {
            Ok(opened) => Ok((surface, opened)),
            Err(e) => {
                surface_loader.destroy_surface(surface, None);
                Err(e)
            }
        },
        Err(e) => Err(vk_fatal(e, "create surface")),
    };

    match opened {
        Ok((surface, opened)) => Ok(Bootstrap {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys: opened.phys,
            device: opened.device,
            families: opened.families,
            max_samples: opened.max_samples,
            device_name: opened.name,
        }),
        Err(e) => {
            if let Some(debug) = &debug {
                debug.destroy();
            }
            instance.destroy_instance(None);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_mapping() {
        assert_eq!(
            device_kind(vk::PhysicalDeviceType::DISCRETE_GPU),
            DeviceKind::Discrete
        );
        assert_eq!(
            device_kind(vk::PhysicalDeviceType::INTEGRATED_GPU),
            DeviceKind::Integrated
        );
        assert_eq!(device_kind(vk::PhysicalDeviceType::OTHER), DeviceKind::Other);
    }

    #[test]
    fn test_khr_rendering_extensions_are_distinct() {
        assert_ne!(KHR_RENDERING[0], KHR_RENDERING[1]);
        assert!(missing_extensions(&KHR_RENDERING, &[KHR_RENDERING[1]]) == [KHR_RENDERING[0]]);
    }
}
