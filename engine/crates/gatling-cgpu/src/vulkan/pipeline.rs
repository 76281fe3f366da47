use std::io::Cursor;

use ash::vk;
use itertools::Itertools;

use crate::basic::desc::{BufferBinding, ImageBinding};
use crate::basic::flags::ResourceAccess;
use crate::error::{CgpuError, CgpuResult};
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::resources::{VulkanBuffer, VulkanImage};

pub struct VulkanShader {
    pub(crate) module: vk::ShaderModule,
}

impl VulkanShader {
    pub fn new(device: &VulkanDevice, spirv: &[u8]) -> CgpuResult<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(spirv)).map_err(|e| {
            log::error!("invalid spir-v ({} bytes): {}", spirv.len(), e);
            CgpuError::UnableToCreateShaderModule
        })?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(|_| CgpuError::UnableToCreateShaderModule)?;
        Ok(Self { module })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.destroy_shader_module(self.module, None) };
    }
}

/// 计算管线及其唯一的 descriptor set
pub struct VulkanPipeline {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) set_layout: vk::DescriptorSetLayout,
    pub(crate) descriptor_pool: vk::DescriptorPool,
    pub(crate) descriptor_set: vk::DescriptorSet,
}

// 创建与销毁
impl VulkanPipeline {
    pub fn new(
        device: &VulkanDevice,
        shader: &VulkanShader,
        buffers: &[BufferBinding<'_, VulkanBuffer>],
        images: &[ImageBinding<'_, VulkanImage>],
        push_constants_size: u32,
    ) -> CgpuResult<Self> {
        let _span = tracy_client::span!("VulkanPipeline::new");
        let dev = &device.device;

        let layout_bindings = buffers
            .iter()
            .map(|b| (b.binding, vk::DescriptorType::STORAGE_BUFFER))
            .chain(images.iter().map(|i| (i.binding, vk::DescriptorType::STORAGE_IMAGE)))
            .map(|(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect_vec();
        let set_layout = unsafe {
            dev.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings),
                None,
            )
        }
        .map_err(|_| CgpuError::UnableToCreateDescriptorLayout)?;
        let set_layout = scopeguard::guard(set_layout, |l| unsafe { dev.destroy_descriptor_set_layout(l, None) });

        let push_constant_ranges = if push_constants_size > 0 {
            vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: push_constants_size,
            }]
        } else {
            vec![]
        };
        let layout = unsafe {
            dev.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(std::slice::from_ref(&*set_layout))
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )
        }
        .map_err(|_| CgpuError::UnableToCreatePipelineLayout)?;
        let layout = scopeguard::guard(layout, |l| unsafe { dev.destroy_pipeline_layout(l, None) });

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(c"main");
        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(*layout);
        let pipeline = unsafe {
            dev.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&create_info), None)
        }
        .map_err(|(_, e)| {
            log::error!("vkCreateComputePipelines failed: {:?}", e);
            CgpuError::UnableToCreateComputePipeline
        })?
        .pop()
        .ok_or(CgpuError::UnableToCreateComputePipeline)?;
        let pipeline = scopeguard::guard(pipeline, |p| unsafe { dev.destroy_pipeline(p, None) });

        let pool_sizes = [
            (vk::DescriptorType::STORAGE_BUFFER, buffers.len() as u32),
            (vk::DescriptorType::STORAGE_IMAGE, images.len() as u32),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect_vec();
        let descriptor_pool = unsafe {
            dev.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&pool_sizes),
                None,
            )
        }
        .map_err(|_| CgpuError::UnableToCreateDescriptorPool)?;
        let descriptor_pool = scopeguard::guard(descriptor_pool, |p| unsafe { dev.destroy_descriptor_pool(p, None) });

        let descriptor_set = unsafe {
            dev.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(*descriptor_pool)
                    .set_layouts(std::slice::from_ref(&*set_layout)),
            )
        }
        .map_err(|_| CgpuError::UnableToAllocateDescriptorSet)?
        .pop()
        .ok_or(CgpuError::UnableToAllocateDescriptorSet)?;

        let pipeline = Self {
            descriptor_pool: scopeguard::ScopeGuard::into_inner(descriptor_pool),
            pipeline: scopeguard::ScopeGuard::into_inner(pipeline),
            layout: scopeguard::ScopeGuard::into_inner(layout),
            set_layout: scopeguard::ScopeGuard::into_inner(set_layout),
            descriptor_set,
        };

        // 只读资源的 descriptor 留给调用方通过 update_bindings 写入
        pipeline.write_descriptors(device, buffers, images, |access| access.contains(ResourceAccess::WRITE));
        Ok(pipeline)
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

// tools
impl VulkanPipeline {
    pub fn update_bindings(
        &mut self,
        device: &VulkanDevice,
        buffers: &[BufferBinding<'_, VulkanBuffer>],
        images: &[ImageBinding<'_, VulkanImage>],
    ) {
        self.write_descriptors(device, buffers, images, |_| true);
    }

    fn write_descriptors(
        &self,
        device: &VulkanDevice,
        buffers: &[BufferBinding<'_, VulkanBuffer>],
        images: &[ImageBinding<'_, VulkanImage>],
        filter: impl Fn(ResourceAccess) -> bool,
    ) {
        let buffer_writes = buffers
            .iter()
            .filter(|b| filter(b.access))
            .map(|b| (b.binding, vk::DescriptorBufferInfo::default().buffer(b.native.buffer).offset(b.offset).range(b.size)))
            .collect_vec();
        let image_writes = images
            .iter()
            .filter(|i| filter(i.access))
            .map(|i| {
                (
                    i.binding,
                    vk::DescriptorImageInfo::default()
                        .sampler(device.sampler)
                        .image_view(i.native.view)
                        .image_layout(vk::ImageLayout::GENERAL),
                )
            })
            .collect_vec();

        let writes = buffer_writes
            .iter()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .chain(image_writes.iter().map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(info))
            }))
            .collect_vec();

        if !writes.is_empty() {
            unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        }
    }
}
