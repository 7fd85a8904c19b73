// Vulkan rendering instance
//
// This holds the entry points and instance-wide debug plumbing that
// Devices are created from.

use ash::extensions::ext;
use ash::{vk, Entry};

use crate::CreateInfo;
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback just prints any errors/warnings
// thrown by the validation layers
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// the Device which the render queue drives.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,
    /// Whether VK_EXT_debug_utils was requested, used to gate
    /// cmd-buffer labels later.
    pub(crate) debug_utils_enabled: bool,

    /// the entry just loads function pointers from the dynamic library
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        return (dr_loader, callback);
    }

    /// Create a vkInstance
    ///
    /// The caller's windowing glue passes the surface extensions it
    /// needs through CreateInfo; we add debug utils on top.
    pub fn new(info: &CreateInfo) -> Self {
        let entry = Entry::linked();
        let app_name = CString::new(info.application_name.as_str()).unwrap();

        let layer_names = vec![
            #[cfg(debug_assertions)]
            CString::new("VK_LAYER_KHRONOS_validation").unwrap(),
        ];

        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let mut extension_names_raw: Vec<*const i8> = info
            .surface_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        extension_names_raw.push(ext::DebugUtils::name().as_ptr());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_1)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .expect("Instance creation error")
        };

        let (dr_loader, d_callback) = Self::setup_debug(&entry, &instance);

        Self {
            loader: entry,
            inst: instance,
            debug_loader: dr_loader,
            debug_callback: d_callback,
            debug_utils_enabled: true,
        }
    }

    /// The raw handles the windowing glue needs to create its
    /// VkSurfaceKHR.
    pub fn entry(&self) -> &Entry {
        &self.loader
    }

    pub fn vk_instance(&self) -> &ash::Instance {
        &self.inst
    }

    /// Push a debug label onto a command buffer, for tools like
    /// renderdoc. The step runner brackets every step with these.
    pub(crate) fn cmd_begin_label(&self, cbuf: vk::CommandBuffer, label: &str) {
        let name = CString::new(label).unwrap_or_default();
        let info = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { self.debug_loader.cmd_begin_debug_utils_label(cbuf, &info) };
    }

    pub(crate) fn cmd_end_label(&self, cbuf: vk::CommandBuffer) {
        unsafe { self.debug_loader.cmd_end_debug_utils_label(cbuf) };
    }

    pub(crate) fn cmd_insert_label(&self, cbuf: vk::CommandBuffer, label: &str) {
        let name = CString::new(label).unwrap_or_default();
        let info = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { self.debug_loader.cmd_insert_debug_utils_label(cbuf, &info) };
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.debug_loader
                .destroy_debug_utils_messenger(self.debug_callback, None);
            self.inst.destroy_instance(None);
        }
    }
}
