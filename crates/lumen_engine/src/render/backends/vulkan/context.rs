//! Vulkan context initialization
//!
//! Instance (with validation layers and a debug messenger in debug builds),
//! window surface, physical device selection and the logical device. Each
//! wrapper destroys its handle on drop; the owner controls the order.

use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};

use super::window::Window;
use super::vk_error;
use crate::render::{RenderError, RenderResult};

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

fn c_string(value: &str) -> RenderResult<CString> {
    CString::new(value).map_err(|e| RenderError::InitializationFailed(format!("Invalid name '{value}': {e}")))
}

/// Instance plus the debug messenger attached to it in debug builds
pub struct VulkanInstance {
    /// Loaded Vulkan library
    pub entry: Entry,
    /// The instance itself
    pub instance: Instance,
    #[cfg(debug_assertions)]
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the extensions the window needs
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> RenderResult<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name = c_string(app_name)?;
        let engine_name = c_string("Lumen")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required = window.required_instance_extensions()?;
        let required = required.iter().map(|ext| c_string(ext)).collect::<RenderResult<Vec<_>>>()?;
        #[allow(unused_mut)]
        let mut extensions: Vec<*const c_char> = required.iter().map(|ext| ext.as_ptr()).collect();

        let validation = cfg!(debug_assertions) && enable_validation;
        #[cfg(debug_assertions)]
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr().cast::<c_char>()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        // SAFETY: every pointer in create_info outlives this call
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(vk_error("create_instance"))?;

        #[cfg(debug_assertions)]
        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    // SAFETY: nothing else was created from the instance yet
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!("Vulkan instance created (validation: {validation})");
        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> RenderResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        // SAFETY: the callback is a plain function with 'static lifetime
        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(vk_error("create_debug_utils_messenger"))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // SAFETY: the owner destroyed every child object before dropping the instance
        unsafe {
            #[cfg(debug_assertions)]
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan instance destroyed");
    }
}

/// Routes validation layer messages into the `log` facade
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }
    vk::FALSE
}

/// Window surface plus its extension loader
pub struct WindowSurface {
    /// `VK_KHR_surface` function table
    pub loader: Surface,
    /// Surface handle
    pub surface: vk::SurfaceKHR,
}

impl WindowSurface {
    /// Create the surface for a window
    pub fn new(instance: &VulkanInstance, window: &mut Window) -> RenderResult<Self> {
        let loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle())?;
        Ok(Self { loader, surface })
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        // SAFETY: every swap chain on this surface is gone by now
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// The GPU chosen for rendering and the queue families it offers
pub struct PhysicalDeviceInfo {
    /// Selected GPU
    pub device: vk::PhysicalDevice,
    /// Name, type and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family the graphics queue comes from
    pub graphics_family: u32,
    /// Family the present queue comes from
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// First device with graphics and present queues and swap chain support
    pub fn select_suitable_device(instance: &Instance, surface: &WindowSurface) -> RenderResult<Self> {
        // SAFETY: the instance is alive
        let devices =
            unsafe { instance.enumerate_physical_devices() }.map_err(vk_error("enumerate_physical_devices"))?;

        for device in devices {
            match Self::evaluate_device(instance, device, surface) {
                Ok(info) => {
                    // SAFETY: device_name is a NUL-terminated array filled by the driver
                    let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
                    log::info!("Selected GPU: {}", name.to_string_lossy());
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping GPU: {e}"),
            }
        }
        Err(RenderError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice, surface: &WindowSurface) -> RenderResult<Self> {
        // SAFETY: device was enumerated from this instance
        let (properties, memory_properties, queue_families) = unsafe {
            (
                instance.get_physical_device_properties(device),
                instance.get_physical_device_memory_properties(device),
                instance.get_physical_device_queue_family_properties(device),
            )
        };

        let mut graphics_family = None;
        let mut present_family = None;
        for (index, family) in (0u32..).zip(queue_families.iter()) {
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }
            // SAFETY: index is a valid queue family of device
            let present_support = unsafe {
                surface
                    .loader
                    .get_physical_device_surface_support(device, index, surface.surface)
            }
            .map_err(vk_error("get_physical_device_surface_support"))?;
            if present_support && present_family.is_none() {
                present_family = Some(index);
            }
            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family
            .ok_or_else(|| RenderError::InitializationFailed("No graphics queue family found".to_string()))?;
        let present_family = present_family
            .ok_or_else(|| RenderError::InitializationFailed("No present queue family found".to_string()))?;

        // SAFETY: device was enumerated from this instance
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(vk_error("enumerate_device_extension_properties"))?;
        let has_swapchain = extensions.iter().any(|available| {
            // SAFETY: extension_name is a NUL-terminated array filled by the driver
            (unsafe { CStr::from_ptr(available.extension_name.as_ptr()) }) == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(RenderError::InitializationFailed(
                "Swap chain extension not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
            present_family,
        })
    }

    /// Queue families that share swap chain images
    pub fn queue_family_indices(&self) -> Vec<u32> {
        if self.graphics_family == self.present_family {
            vec![self.graphics_family]
        } else {
            vec![self.graphics_family, self.present_family]
        }
    }

    /// Index of a memory type allowed by `type_filter` with all `properties`
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> RenderResult<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .zip(0u32..)
            .find(|(memory_type, index)| {
                type_filter & (1 << index) != 0 && memory_type.property_flags.contains(properties)
            })
            .map(|(_, index)| index)
            .ok_or(RenderError::OutOfMemory {
                operation: "find_memory_type",
            })
    }
}

/// Logical device, its two queues and the swap chain loader
pub struct LogicalDevice {
    /// Device function table
    pub device: Device,
    /// Queue all frames are submitted to
    pub graphics_queue: vk::Queue,
    /// Queue swap chain images are presented on
    pub present_queue: vk::Queue,
    /// Swap chain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Whether `samplerAnisotropy` was enabled
    pub anisotropy_enabled: bool,
}

impl LogicalDevice {
    /// Create the device with one graphics and one present queue
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> RenderResult<Self> {
        let unique_families: HashSet<u32> = [physical.graphics_family, physical.present_family].into_iter().collect();
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [SwapchainLoader::name().as_ptr()];
        // SAFETY: the physical device belongs to this instance
        let supported = unsafe { instance.get_physical_device_features(physical.device) };
        let anisotropy_enabled = supported.sampler_anisotropy == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(anisotropy_enabled)
            .build();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        // SAFETY: every pointer in create_info outlives this call
        let device = unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(vk_error("create_device"))?;
        // SAFETY: both families were requested with one queue each
        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(physical.graphics_family, 0),
                device.get_device_queue(physical.present_family, 0),
            )
        };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
            anisotropy_enabled,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // SAFETY: the owner destroyed every object created from this device
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
        log::debug!("Logical device destroyed");
    }
}
