use std::ffi::{c_char, CStr};

use ash::{ext::debug_utils, khr::surface, vk, Entry, Instance};
use log::{debug, error, info, warn};

use super::surface::SurfaceProvider;
use crate::{RenderError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the Vulkan entry, the instance, the optional validation messenger and
/// the presentation surface. Dropped after every device-level object.
pub struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    debug_utils: Option<debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Creates an instance with the extensions `provider` needs and a surface
    /// from it. Validation is enabled only if the layer is installed.
    pub fn new<S: SurfaceProvider + ?Sized>(provider: &S, enable_validation: bool) -> Result<Self> {
        unsafe {
            let entry = Entry::load()?;

            let layers = if enable_validation {
                Self::validation_layers(&entry)?
            } else {
                Vec::new()
            };
            let validation = !layers.is_empty();

            let mut extensions = provider.required_extensions();
            if validation {
                extensions.push(debug_utils::NAME.as_ptr());
            }

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"ash_instancing")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"ash_instancing")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);

            let mut messenger_info = Self::messenger_create_info();
            let mut create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions)
                .enabled_layer_names(&layers);
            if validation {
                create_info = create_info.push_next(&mut messenger_info);
            }

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| RenderError::Creation(format!("instance: {e}")))?;

            let (debug_utils, debug_messenger) = if validation {
                let utils = debug_utils::Instance::new(&entry, &instance);
                match utils.create_debug_utils_messenger(&Self::messenger_create_info(), None) {
                    Ok(messenger) => (Some(utils), Some(messenger)),
                    Err(e) => {
                        warn!("Debug messenger unavailable: {e}");
                        (None, None)
                    }
                }
            } else {
                (None, None)
            };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = match provider.create_surface(&entry, &instance) {
                Ok(surface) => surface,
                Err(e) => {
                    if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                        utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

            info!(
                "Vulkan instance created (validation {})",
                if validation { "on" } else { "off" }
            );

            Ok(Self {
                entry,
                instance,
                surface_loader,
                surface,
                debug_utils,
                debug_messenger,
            })
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    unsafe fn validation_layers(entry: &Entry) -> Result<Vec<*const c_char>> {
        let available = entry.enumerate_instance_layer_properties()?;
        let found = available
            .iter()
            .any(|layer| CStr::from_ptr(layer.layer_name.as_ptr()) == VALIDATION_LAYER);

        if found {
            Ok(vec![VALIDATION_LAYER.as_ptr()])
        } else {
            warn!("Validation layer {VALIDATION_LAYER:?} not available");
            Ok(Vec::new())
        }
    }

    fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }

            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
                self.surface = vk::SurfaceKHR::null();
            }

            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        String::from("<null>")
    } else {
        CStr::from_ptr((*callback_data).p_message)
            .to_string_lossy()
            .into_owned()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{message_types:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{message_types:?}] {message}");
    } else {
        debug!(target: "vulkan", "[{message_types:?}] {message}");
    }

    vk::FALSE
}
