// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and debug utils
// - Physical device selection by enumeration index
// - Logical device + single transfer-capable queue
// - Memory allocator setup
// - Preflight checks for the transfer under test

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use crate::config::DeviceConfig;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Debug utils messenger, taken on drop
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_name: String,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `config` - GPU index and validation settings
    pub fn new(app_name: &str, config: &DeviceConfig) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation =
            config.validation_layers && Self::validation_layer_available(&entry)?;
        let messenger_info = debug_messenger_info(config.verbose_validation);

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, &messenger_info)?;

        // Step 3: Setup debug messenger
        let debug_utils = Some(Self::setup_debug_messenger(&entry, &instance, &messenger_info)?);

        // Step 4: Pick physical device (GPU)
        let physical_device = Self::pick_physical_device(&instance, config.gpu_index)?;

        // Step 5: Cache device properties
        let properties = unsafe {
            instance.get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Using device: {}", device_name);
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));

        // Step 6: Pick a queue family that can transfer
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };
        let queue_family = pick_queue_family(&queue_families)
            .with_context(|| format!("No transfer-capable queue family on {}", device_name))?;
        log::debug!("Queue family {}: {:?}",
            queue_family,
            queue_families[queue_family as usize].queue_flags);

        // Step 7: Create logical device
        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family)?;

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
            properties,
            memory_properties,
            device_name,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        let available = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !available {
            log::warn!(
                "{} not installed, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        Ok(available)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        messenger_info: &vk::DebugUtilsMessengerCreateInfoEXT,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 0, 1))
            .engine_name(&app_name_cstr)
            .engine_version(vk::make_api_version(0, 0, 0, 1))
            .api_version(vk::API_VERSION_1_1);

        let extensions = [ash::extensions::ext::DebugUtils::name().as_ptr()];

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Chained so instance creation and destruction are reported too
        let mut instance_messenger_info = *messenger_info;

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .push_next(&mut instance_messenger_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        messenger_info: &vk::DebugUtilsMessengerCreateInfoEXT,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(messenger_info, None)
        }
        .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        gpu_index: usize,
    ) -> Result<vk::PhysicalDevice> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        for (i, &device) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(device) };
            log::debug!(
                "GPU {}: {} ({:?})",
                i,
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
                props.device_type
            );
        }

        devices.get(gpu_index).copied().with_context(|| {
            format!("GPU index {} out of range ({} devices found)", gpu_index, devices.len())
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // No extensions, no features: nothing beyond core transfer commands
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Check the device can run the transfer for an image of this size and format
    pub fn check_transfer_support(&self, width: u32, height: u32, format: vk::Format) -> Result<()> {
        let max_dimension = self.properties.limits.max_image_dimension2_d;
        if width > max_dimension || height > max_dimension {
            anyhow::bail!(
                "{}x{} exceeds maxImageDimension2D ({}) on {}",
                width,
                height,
                max_dimension,
                self.device_name
            );
        }

        let format_props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        let required = vk::FormatFeatureFlags::TRANSFER_SRC | vk::FormatFeatureFlags::TRANSFER_DST;
        if !format_props.optimal_tiling_features.contains(required) {
            anyhow::bail!(
                "{:?} lacks optimal-tiling transfer support on {} (has {:?})",
                format,
                self.device_name,
                format_props.optimal_tiling_features
            );
        }

        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Allocator frees its memory blocks through the device
        drop(self.allocator.lock().take());

        // Cleanup in reverse order
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// First family with graphics or compute (both imply transfer), else a
/// dedicated transfer family
pub fn pick_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let usable = |f: &vk::QueueFamilyProperties| f.queue_count > 0;

    families
        .iter()
        .position(|f| {
            usable(f) && f.queue_flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .or_else(|| {
            families
                .iter()
                .position(|f| usable(f) && f.queue_flags.contains(vk::QueueFlags::TRANSFER))
        })
        .map(|i| i as u32)
}

fn debug_messenger_info(verbose: bool) -> vk::DebugUtilsMessengerCreateInfoEXT {
    let mut severity =
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    if verbose {
        severity |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
    }

    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(severity)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
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
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_graphics_or_compute_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(pick_queue_family(&families), Some(1));
    }

    #[test]
    fn falls_back_to_transfer_only_family() {
        let families = [
            family(vk::QueueFlags::SPARSE_BINDING, 1),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(pick_queue_family(&families), Some(1));
    }

    #[test]
    fn skips_families_without_queues() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::SPARSE_BINDING, 1),
        ];
        assert_eq!(pick_queue_family(&families), None);
    }

    #[test]
    fn verbose_messenger_includes_info_and_verbose() {
        let quiet = debug_messenger_info(false);
        let verbose = debug_messenger_info(true);

        assert!(!quiet.message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE));
        assert!(verbose.message_severity.contains(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
        ));
        assert!(verbose.pfn_user_callback.is_some());
    }
}
