//! Vulkan bootstrap for `verify --backend vulkan`.
//!
//! Creates an instance and a logical device on the first Vulkan 1.3 physical
//! device with a graphics+compute queue, enables dynamic rendering and hands
//! everything to an [`AshDriver`].

use std::sync::Arc;

use anyhow::{anyhow, Context};
use ash::vk;
use tracing::info;

use gpurt_runtime::AshDriver;

pub struct VulkanDevice {
    pub driver: Arc<AshDriver>,
    pub device_name: String,
    pub api_version: u32,
}

struct Selected {
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    device_name: String,
    api_version: u32,
}

pub fn create_device() -> anyhow::Result<VulkanDevice> {
    let entry = unsafe { ash::Entry::load() }.context("Vulkan loader not available")?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"gpurt verify")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"gpurt")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("vkCreateInstance failed")?;

    let opened = select_physical_device(&instance)
        .and_then(|s| create_logical_device(&instance, &s).map(|device| (s, device)));
    let (selected, device) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            return Err(e);
        }
    };

    info!(
        device = %selected.device_name,
        queue_family = selected.queue_family_index,
        "created Vulkan device"
    );

    let driver = AshDriver::new(entry, instance, device, selected.queue_family_index, false)
        .context("failed to initialize ash driver")?;
    Ok(VulkanDevice {
        driver: Arc::new(driver),
        device_name: selected.device_name,
        api_version: selected.api_version,
    })
}

fn select_physical_device(instance: &ash::Instance) -> anyhow::Result<Selected> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    let mut best: Option<(Selected, bool)> = None;

    for pd in physical_devices {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        if props.api_version < vk::API_VERSION_1_3 {
            continue;
        }
        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        let Some(family) = families.iter().position(|qf| {
            qf.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        }) else {
            continue;
        };

        let device_name = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        if best.as_ref().is_some_and(|(_, d)| *d || !discrete) {
            continue;
        }
        best = Some((
            Selected {
                physical_device: pd,
                queue_family_index: family as u32,
                device_name,
                api_version: props.api_version,
            },
            discrete,
        ));
    }

    best.map(|(selected, _)| selected)
        .ok_or_else(|| anyhow!("no Vulkan 1.3 device with a graphics+compute queue"))
}

fn create_logical_device(instance: &ash::Instance, selected: &Selected) -> anyhow::Result<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family_index)
        .queue_priorities(&priorities)];
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(selected.physical_device, &device_info, None) }
        .context("vkCreateDevice failed")?;
    Ok(device)
}
