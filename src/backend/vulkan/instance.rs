//! Instance creation and physical device discovery

use std::ffi::{CStr, FromBytesUntilNulError};

use ash::vk;
use serde::Serialize;

use crate::backend::error::{DeviceError, VkResultExt};
use crate::config::{Enumerated, EnumerationLimits};
use crate::error::{ForgeError, ForgeResult};

const APPLICATION_NAME: &CStr = c"bdaforge";

/// Chained feature queries need at least Vulkan 1.1
const MIN_INSTANCE_VERSION: u32 = vk::API_VERSION_1_1;

/// `major.minor.patch` of a packed Vulkan version
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "other",
    }
}

fn owned_name(name: Result<&CStr, FromBytesUntilNulError>) -> String {
    name.map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// An instance layer and the extensions it provides
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    pub name: String,
    pub description: String,
    pub extensions: Vec<String>,
    pub extensions_truncated: bool,
}

impl LayerInfo {
    pub fn is_validation(&self) -> bool {
        self.name.contains("validation")
    }
}

/// Summary of one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalDeviceInfo {
    pub index: usize,
    pub name: String,
    pub device_type: &'static str,
    pub api_version: u32,
    pub driver_version: u32,
}

impl std::fmt::Display for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}), Vulkan {}, driver {:08X}",
            self.index,
            self.name,
            self.device_type,
            format_version(self.api_version),
            self.driver_version
        )
    }
}

/// What the loader and driver expose, for `bdaforge devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub instance_version: String,
    pub layers: Vec<LayerInfo>,
    pub layers_truncated: bool,
    pub validation_layer: bool,
    pub devices: Vec<PhysicalDeviceInfo>,
    pub devices_truncated: bool,
}

impl std::fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Vulkan instance {}", self.instance_version)?;
        writeln!(
            f,
            "{} layer(s){}, validation layer {}",
            self.layers.len(),
            if self.layers_truncated { " (truncated)" } else { "" },
            if self.validation_layer { "present" } else { "absent" }
        )?;
        for layer in &self.layers {
            writeln!(f, "  {} ({} extensions)", layer.name, layer.extensions.len())?;
        }
        if self.devices.is_empty() {
            return write!(f, "No Vulkan devices found");
        }
        for device in &self.devices {
            writeln!(f, "{}", device)?;
        }
        if self.devices_truncated {
            write!(f, "(device list truncated)")?;
        }
        Ok(())
    }
}

/// Owns the loader entry and the `VkInstance`
pub struct VulkanInstance {
    // Keeps the loader library loaded for the instance's lifetime
    _entry: ash::Entry,
    instance: ash::Instance,
    api_version: u32,
    layers: Enumerated<LayerInfo>,
}

impl VulkanInstance {
    /// Load the Vulkan loader, report layers and create an instance at the
    /// highest version the loader supports
    pub fn new(limits: &EnumerationLimits) -> ForgeResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ForgeError::CapabilityMissing(format!("Vulkan loader: {}", e)))?;

        let layers = enumerate_layers(&entry, limits)?;
        tracing::info!("VulkanInstance: found {} layer(s)", layers.len());
        if let Some(layer) = layers.iter().find(|l| l.is_validation()) {
            tracing::info!("VulkanInstance: validation layer present: {}", layer.name);
        }

        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .call("vkEnumerateInstanceVersion")?
            .unwrap_or(vk::API_VERSION_1_0);
        tracing::info!(
            "VulkanInstance: instance API version {}",
            format_version(api_version)
        );
        if api_version < MIN_INSTANCE_VERSION {
            return Err(ForgeError::CapabilityMissing(format!(
                "instance API version {} is below 1.1",
                format_version(api_version)
            )));
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(APPLICATION_NAME)
            .application_version(1)
            .engine_name(APPLICATION_NAME)
            .engine_version(1)
            .api_version(api_version);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|result| {
            if result == vk::Result::ERROR_INCOMPATIBLE_DRIVER {
                tracing::error!("VulkanInstance: no compatible Vulkan driver found");
            }
            DeviceError::new("vkCreateInstance", result)
        })?;

        Ok(Self {
            _entry: entry,
            instance,
            api_version,
            layers,
        })
    }

    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn layers(&self) -> &Enumerated<LayerInfo> {
        &self.layers
    }

    pub fn has_validation_layer(&self) -> bool {
        self.layers.iter().any(LayerInfo::is_validation)
    }

    /// Physical devices with their summaries, in driver order
    pub fn physical_devices(
        &self,
        limits: &EnumerationLimits,
    ) -> ForgeResult<Enumerated<(vk::PhysicalDevice, PhysicalDeviceInfo)>> {
        let handles = unsafe { self.instance.enumerate_physical_devices() }
            .call("vkEnumeratePhysicalDevices")?;
        let devices = Enumerated::bounded(handles, limits.max_devices, "physical devices");

        let items = devices
            .items
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                let props = unsafe { self.instance.get_physical_device_properties(handle) };
                let info = PhysicalDeviceInfo {
                    index,
                    name: owned_name(props.device_name_as_c_str()),
                    device_type: device_type_name(props.device_type),
                    api_version: props.api_version,
                    driver_version: props.driver_version,
                };
                (handle, info)
            })
            .collect();

        Ok(Enumerated {
            items,
            truncated: devices.truncated,
        })
    }

    /// Extension names supported by `device`
    pub fn device_extensions(
        &self,
        device: vk::PhysicalDevice,
        limits: &EnumerationLimits,
    ) -> ForgeResult<Enumerated<String>> {
        let props = unsafe { self.instance.enumerate_device_extension_properties(device) }
            .call("vkEnumerateDeviceExtensionProperties")?;
        tracing::info!(
            "VulkanInstance: selected device supports {} extensions",
            props.len()
        );
        let names = props
            .iter()
            .map(|p| owned_name(p.extension_name_as_c_str()))
            .collect();
        Ok(Enumerated::bounded(
            names,
            limits.max_extensions,
            "device extensions",
        ))
    }

    pub fn queue_families(
        &self,
        device: vk::PhysicalDevice,
        limits: &EnumerationLimits,
    ) -> Enumerated<vk::QueueFamilyProperties> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        };
        Enumerated::bounded(families, limits.max_queue_families, "queue families")
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
        tracing::debug!("VulkanInstance: destroyed");
    }
}

fn enumerate_layers(
    entry: &ash::Entry,
    limits: &EnumerationLimits,
) -> ForgeResult<Enumerated<LayerInfo>> {
    let props = unsafe { entry.enumerate_instance_layer_properties() }
        .call("vkEnumerateInstanceLayerProperties")?;
    let props = Enumerated::bounded(props, limits.max_layers, "instance layers");

    let mut layers = Vec::with_capacity(props.len());
    for layer in props.iter() {
        let name_cstr = layer.layer_name_as_c_str().ok();
        let extensions = match name_cstr {
            Some(name) => unsafe { entry.enumerate_instance_extension_properties(Some(name)) }
                .call("vkEnumerateInstanceExtensionProperties")?,
            None => Vec::new(),
        };
        let extensions = Enumerated::bounded(
            extensions
                .iter()
                .map(|e| owned_name(e.extension_name_as_c_str()))
                .collect(),
            limits.max_extensions,
            "layer extensions",
        );
        layers.push(LayerInfo {
            name: owned_name(layer.layer_name_as_c_str()),
            description: owned_name(layer.description_as_c_str()),
            extensions: extensions.items,
            extensions_truncated: extensions.truncated,
        });
    }

    Ok(Enumerated {
        items: layers,
        truncated: props.truncated,
    })
}

/// Create a throwaway instance and describe it with its physical devices
pub fn describe_system(limits: &EnumerationLimits) -> ForgeResult<SystemInfo> {
    let instance = VulkanInstance::new(limits)?;
    let devices = instance.physical_devices(limits)?;
    let layers = instance.layers();
    Ok(SystemInfo {
        instance_version: format_version(instance.api_version()),
        layers: layers.items.clone(),
        layers_truncated: layers.truncated,
        validation_layer: instance.has_validation_layer(),
        devices: devices.items.into_iter().map(|(_, info)| info).collect(),
        devices_truncated: devices.truncated,
    })
}

pub fn list_physical_devices(limits: &EnumerationLimits) -> ForgeResult<Vec<PhysicalDeviceInfo>> {
    Ok(describe_system(limits)?.devices)
}
