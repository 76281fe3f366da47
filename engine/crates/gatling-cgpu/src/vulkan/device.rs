use std::ffi::{CStr, CString};

use ash::vk;
use itertools::Itertools;

use crate::basic::flags::MemoryProperties;
use crate::basic::limits::DeviceLimits;
use crate::context::MAX_TIMESTAMP_QUERIES;
use crate::error::{CgpuError, CgpuResult};

/// vkCmdUpdateBuffer 允许的最大数据量，由 Vulkan 规范固定
const MAX_BUFFER_UPDATE_SIZE: u64 = 65536;

/// 逻辑设备，以及在其上创建的唯一一个计算队列、command pool、sampler 与 timestamp query pool
pub struct VulkanDevice {
    pub(crate) device: ash::Device,
    pub(crate) queue: vk::Queue,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) sampler: vk::Sampler,
    pub(crate) timestamp_pool: vk::QueryPool,
    pub(crate) memory_types: Vec<MemoryProperties>,
    pub(crate) limits: DeviceLimits,
}

// 创建与销毁
impl VulkanDevice {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        required_extensions: &[String],
    ) -> CgpuResult<Self> {
        let _span = tracy_client::span!("VulkanDevice::new");

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = properties.device_name_as_c_str().unwrap_or(c"unknown").to_string_lossy().into_owned();
        log::info!(
            "physical device: {}, api version: {}.{}.{}",
            device_name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        if properties.api_version < vk::API_VERSION_1_1 {
            log::error!("device {} only supports vulkan {}", device_name, properties.api_version);
            return Err(CgpuError::VkVersionNotSupported);
        }

        let subgroup = Self::subgroup_properties(instance, physical_device);
        let required_subgroup_ops = vk::SubgroupFeatureFlags::BASIC | vk::SubgroupFeatureFlags::BALLOT;
        if !subgroup.supported_stages.contains(vk::ShaderStageFlags::COMPUTE)
            || !subgroup.supported_operations.contains(required_subgroup_ops)
        {
            log::error!("device {} lacks compute subgroup basic/ballot support", device_name);
            return Err(CgpuError::FeatureRequirementsNotMet);
        }

        let enabled_exts = Self::select_extensions(instance, physical_device, required_extensions)?;
        let queue_family_index = Self::find_compute_queue_family(instance, physical_device)?;

        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let enabled_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(features.sampler_anisotropy == vk::TRUE)
            .shader_int64(features.shader_int64 == vk::TRUE);

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let ext_ptrs = enabled_exts.iter().map(|e| e.as_ptr()).collect_vec();
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&ext_ptrs)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| {
                log::error!("vkCreateDevice failed: {:?}", e);
                CgpuError::CanNotCreateLogicalDevice
            })?;
        let device = scopeguard::guard(device, |device| unsafe { device.destroy_device(None) });

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .map_err(|_| CgpuError::CanNotCreateCommandPool)?;
        let command_pool = scopeguard::guard(command_pool, |pool| unsafe { device.destroy_command_pool(pool, None) });

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(features.sampler_anisotropy == vk::TRUE)
            .max_anisotropy(16.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::NEVER)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }.map_err(|_| CgpuError::UnableToCreateSampler)?;
        let sampler = scopeguard::guard(sampler, |sampler| unsafe { device.destroy_sampler(sampler, None) });

        let timestamp_pool = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo::default().query_type(vk::QueryType::TIMESTAMP).query_count(MAX_TIMESTAMP_QUERIES),
                None,
            )
        }
        .map_err(|_| CgpuError::UnableToCreateQueryPool)?;

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_types = memory_properties.memory_types[..memory_properties.memory_type_count as usize]
            .iter()
            .map(|t| MemoryProperties::from_bits_truncate(t.property_flags.as_raw()))
            .collect_vec();

        let limits = Self::limits_snapshot(&properties.limits, subgroup.subgroup_size);
        log::info!("compute queue family: {}, subgroup size: {}", queue_family_index, limits.subgroup_size);

        let sampler = scopeguard::ScopeGuard::into_inner(sampler);
        let command_pool = scopeguard::ScopeGuard::into_inner(command_pool);
        let device = scopeguard::ScopeGuard::into_inner(device);
        Ok(Self {
            device,
            queue,
            command_pool,
            sampler,
            timestamp_pool,
            memory_types,
            limits,
        })
    }

    pub fn destroy(self) {
        log::info!("destroying vulkan device");
        unsafe {
            // 等待所有提交完成，销毁路径上不关心返回值
            let _ = self.device.device_wait_idle();
            self.device.destroy_query_pool(self.timestamp_pool, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

// 创建过程的辅助函数
impl VulkanDevice {
    fn subgroup_properties(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceSubgroupProperties<'static> {
        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        {
            let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        }
        subgroup.p_next = std::ptr::null_mut();
        subgroup
    }

    /// 必需扩展缺失时报错；portability subset 存在时必须启用
    fn select_extensions(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        required_extensions: &[String],
    ) -> CgpuResult<Vec<CString>> {
        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .map_err(|_| CgpuError::CanNotCreateLogicalDevice)?;
        let available_names = available
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect_vec();

        let mut enabled = Vec::with_capacity(required_extensions.len() + 1);
        for ext in required_extensions {
            if !available_names.contains(ext) {
                log::error!("device extension {} not supported", ext);
                return Err(CgpuError::DeviceExtensionNotSupported(ext.clone()));
            }
            let name = CString::new(ext.as_str()).map_err(|_| CgpuError::DeviceExtensionNotSupported(ext.clone()))?;
            enabled.push(name);
        }

        let portability: &CStr = ash::khr::portability_subset::NAME;
        let portability_name = portability.to_string_lossy();
        if available_names.iter().any(|n| *n == portability_name) && !enabled.iter().any(|e| e.as_c_str() == portability) {
            enabled.push(portability.to_owned());
        }

        let mut exts_str = String::new();
        for ext in &enabled {
            exts_str.push_str(&format!("\n\t{:?}", ext));
        }
        log::info!("device exts: {}", exts_str);
        Ok(enabled)
    }

    /// 同时支持 compute 与 transfer 的第一个 queue family
    fn find_compute_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> CgpuResult<u32> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        families
            .iter()
            .position(|family| {
                family.queue_flags.contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER) && family.queue_count > 0
            })
            .map(|index| index as u32)
            .ok_or(CgpuError::NoComputeQueueFamily)
    }

    fn limits_snapshot(limits: &vk::PhysicalDeviceLimits, subgroup_size: u32) -> DeviceLimits {
        DeviceLimits {
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_push_constants_size: limits.max_push_constants_size,
            max_buffer_update_size: MAX_BUFFER_UPDATE_SIZE,
            max_storage_buffer_range: limits.max_storage_buffer_range,
            max_compute_work_group_count: limits.max_compute_work_group_count,
            max_compute_work_group_size: limits.max_compute_work_group_size,
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_image_dimension_3d: limits.max_image_dimension3_d,
            subgroup_size,
            timestamp_period: limits.timestamp_period,
        }
    }
}
