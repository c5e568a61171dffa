// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers (debug builds only)
// - Debug messenger
// - Window surface
// - Physical device selection (first suitable GPU)
// - Logical device + graphics/present/transfer queues
// - MSAA sample count

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface, khr::Swapchain as SwapchainLoader};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device features the renderer enables; selection rejects GPUs without them.
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    sample_rate_shading: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Queue family indices used by the renderer.
///
/// Graphics and present may coincide; transfer may coincide with graphics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Distinct family indices, one queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.present, self.transfer]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// True when every role maps to the same family.
    pub fn is_shared(&self) -> bool {
        self.unique().len() == 1
    }
}

/// Pick graphics, present and transfer families from a device's family list.
///
/// The transfer family must also support graphics: staged uploads skip the
/// queue-family ownership transfer, which is only valid when the copying
/// family can hand resources straight to the graphics pipeline.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let usable = |f: &vk::QueueFamilyProperties| f.queue_count > 0;

    let graphics = families
        .iter()
        .position(|f| usable(f) && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;

    let present = if supports_present(graphics) {
        graphics
    } else {
        (0..families.len() as u32).find(|&i| usable(&families[i as usize]) && supports_present(i))?
    };

    let transfer = families
        .iter()
        .position(|f| {
            usable(f)
                && f.queue_flags
                    .contains(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS)
        })
        .map(|i| i as u32)
        .unwrap_or(graphics);

    Some(QueueFamilies {
        graphics,
        present,
        transfer,
    })
}

/// Highest sample count supported for both color and depth framebuffers,
/// never above `cap`.
pub fn max_usable_sample_count(
    limits: &vk::PhysicalDeviceLimits,
    cap: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    let counts = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    [
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .filter(|&c| c.as_raw() <= cap.as_raw())
    .find(|&c| counts.contains(c))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Vulkan device context with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Surface (created against our instance for the window collaborator)
    pub surface_loader: Surface,
    pub surface: vk::SurfaceKHR,

    // Queue handles
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: vk::Queue,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub msaa_samples: vk::SampleCountFlags,
}

impl VulkanDevice {
    /// Create the device context for a window.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `display` / `window` - Raw handles of the window to present into
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `msaa_cap` - Upper bound for the MSAA sample count
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        enable_validation: bool,
        msaa_cap: vk::SampleCountFlags,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation {
            Self::check_validation_layer(&entry)?;
        }

        let instance = Self::create_instance(&entry, app_name, display, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
            .context("Failed to create window surface")?;

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue, transfer_queue) =
            Self::create_logical_device(&instance, physical_device, &queue_families)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let msaa_samples = max_usable_sample_count(&properties.limits, msaa_cap);

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={} transfer={}",
            queue_families.graphics,
            queue_families.present,
            queue_families.transfer
        );
        log::info!("MSAA samples: {:?}", msaa_samples);

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            debug_utils,
            properties,
            memory_properties,
            msaa_samples,
        }))
    }

    fn check_validation_layer(entry: &Entry) -> Result<()> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            anyhow::bail!("Validation layers requested, but not available");
        }
        Ok(())
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Window system extensions, plus debug utils when validating
        let mut extensions = ash_window::enumerate_required_extensions(display)
            .context("Failed to query window surface extensions")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Covers vkCreateInstance/vkDestroyInstance, which the messenger can't see
        let mut debug_info = debug_messenger_info().build();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None) }
                .context("Failed to setup debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Accept the first GPU that satisfies every requirement.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            match Self::check_device(instance, surface_loader, surface, device, &props) {
                Ok(Some(families)) => return Ok((device, families)),
                Ok(None) => log::debug!("Skipping unsuitable GPU: {}", name),
                Err(e) => log::warn!("Skipping GPU {}: {:#}", name, e),
            }
        }

        anyhow::bail!("No suitable GPU found")
    }

    fn check_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
        props: &vk::PhysicalDeviceProperties,
    ) -> Result<Option<QueueFamilies>> {
        if !matches!(
            props.device_type,
            vk::PhysicalDeviceType::DISCRETE_GPU | vk::PhysicalDeviceType::INTEGRATED_GPU
        ) {
            return Ok(None);
        }

        let features = unsafe { instance.get_physical_device_features(device) };
        if !check_device_features(&features) {
            return Ok(None);
        }

        if !Self::supports_required_extensions(instance, device)? {
            return Ok(None);
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        let families = find_queue_families(&queue_families, |index| unsafe {
            present_supported(
                surface_loader.get_physical_device_surface_support(device, index, surface),
                index,
            )
        });
        let Some(families) = families else {
            return Ok(None);
        };

        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }?;
        if formats.is_empty() || present_modes.is_empty() {
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn supports_required_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;

        Ok(has_extension(&available, SwapchainLoader::name()))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [SwapchainLoader::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let (graphics_queue, present_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.present, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };

        Ok((device, graphics_queue, present_queue, transfer_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }

    /// Highest anisotropy the sampler may request.
    pub fn max_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // device -> debug messenger -> surface -> instance
        unsafe {
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

/// A failed query counts as no support for that family
fn present_supported(query: ash::prelude::VkResult<bool>, family: u32) -> bool {
    query.unwrap_or_else(|e| {
        log::warn!("Present support query failed for queue family {}: {}", family, e);
        false
    })
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == name)
}

fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
    features.sampler_anisotropy == vk::TRUE && features.sample_rate_shading == vk::TRUE
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXTBuilder<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    eprintln!("Validation Layer: {}", message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}
