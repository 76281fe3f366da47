use ash::vk;
use itertools::Itertools;

use crate::basic::desc::{BufferImageCopyDesc, MemoryBarrier, ResolvedBufferBarrier};
use crate::error::{CgpuError, CgpuResult};
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::pipeline::VulkanPipeline;
use crate::vulkan::resources::{VulkanBuffer, VulkanImage, color_subresource_range, vk_access_flags};

/// 屏障统一作用在 compute shader 与 transfer 两个阶段
const BARRIER_STAGES: vk::PipelineStageFlags =
    vk::PipelineStageFlags::from_raw(vk::PipelineStageFlags::COMPUTE_SHADER.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw());

pub struct VulkanCommandBuffer {
    pub(crate) handle: vk::CommandBuffer,
}

pub struct VulkanFence {
    pub(crate) handle: vk::Fence,
}

// 创建与销毁
impl VulkanCommandBuffer {
    pub fn new(device: &VulkanDevice) -> CgpuResult<Self> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let handle = unsafe { device.device.allocate_command_buffers(&allocate_info) }
            .map_err(|_| CgpuError::UnableToAllocateCommandBuffer)?
            .pop()
            .ok_or(CgpuError::UnableToAllocateCommandBuffer)?;
        Ok(Self { handle })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.free_command_buffers(device.command_pool, std::slice::from_ref(&self.handle)) };
    }

    pub fn begin(&mut self, device: &VulkanDevice) -> CgpuResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        unsafe { device.device.begin_command_buffer(self.handle, &begin_info) }
            .map_err(|_| CgpuError::UnableToBeginCommandBuffer)
    }

    pub fn end(&mut self, device: &VulkanDevice) -> CgpuResult<()> {
        unsafe { device.device.end_command_buffer(self.handle) }.map_err(|_| CgpuError::UnableToEndCommandBuffer)
    }
}

// 命令录制
impl VulkanCommandBuffer {
    pub fn bind_pipeline(&mut self, device: &VulkanDevice, pipeline: &VulkanPipeline) {
        unsafe {
            device.device.cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.device.cmd_bind_descriptor_sets(
                self.handle,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                std::slice::from_ref(&pipeline.descriptor_set),
                &[],
            );
        }
    }

    pub fn copy_buffer(
        &mut self,
        device: &VulkanDevice,
        src: &VulkanBuffer,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe { device.device.cmd_copy_buffer(self.handle, src.buffer, dst.buffer, std::slice::from_ref(&region)) };
    }

    pub fn update_buffer(&mut self, device: &VulkanDevice, data: &[u8], dst: &VulkanBuffer, dst_offset: u64) {
        unsafe { device.device.cmd_update_buffer(self.handle, dst.buffer, dst_offset, data) };
    }

    pub fn copy_buffer_to_image(
        &mut self,
        device: &VulkanDevice,
        src: &VulkanBuffer,
        dst: &mut VulkanImage,
        region: &BufferImageCopyDesc,
    ) {
        if dst.layout != vk::ImageLayout::GENERAL {
            self.transition_to_general(device, dst);
        }

        let copy = vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: region.texel_offset_x as i32,
                y: region.texel_offset_y as i32,
                z: region.texel_offset_z as i32,
            },
            image_extent: vk::Extent3D {
                width: region.texel_extent_x,
                height: region.texel_extent_y,
                depth: region.texel_extent_z,
            },
        };
        unsafe {
            device.device.cmd_copy_buffer_to_image(
                self.handle,
                src.buffer,
                dst.image,
                vk::ImageLayout::GENERAL,
                std::slice::from_ref(&copy),
            )
        };
        dst.access = vk::AccessFlags::TRANSFER_WRITE;
    }

    fn transition_to_general(&mut self, device: &VulkanDevice, image: &mut VulkanImage) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(image.access)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .old_layout(image.layout)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(color_subresource_range());
        unsafe {
            device.device.cmd_pipeline_barrier(
                self.handle,
                vk::PipelineStageFlags::TOP_OF_PIPE | BARRIER_STAGES,
                BARRIER_STAGES,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            )
        };
        image.layout = vk::ImageLayout::GENERAL;
    }

    pub fn push_constants(&mut self, device: &VulkanDevice, pipeline: &VulkanPipeline, data: &[u8]) {
        unsafe {
            device.device.cmd_push_constants(self.handle, pipeline.layout, vk::ShaderStageFlags::COMPUTE, 0, data)
        };
    }

    pub fn dispatch(&mut self, device: &VulkanDevice, group_count: [u32; 3]) {
        unsafe { device.device.cmd_dispatch(self.handle, group_count[0], group_count[1], group_count[2]) };
    }

    pub fn pipeline_barrier(
        &mut self,
        device: &VulkanDevice,
        barriers: &[MemoryBarrier],
        buffer_barriers: &[ResolvedBufferBarrier<'_, VulkanBuffer>],
    ) {
        let memory_barriers = barriers
            .iter()
            .map(|b| {
                vk::MemoryBarrier::default()
                    .src_access_mask(vk_access_flags(b.src_access))
                    .dst_access_mask(vk_access_flags(b.dst_access))
            })
            .collect_vec();
        let buffer_memory_barriers = buffer_barriers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk_access_flags(b.src_access))
                    .dst_access_mask(vk_access_flags(b.dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(b.native.buffer)
                    .offset(b.offset)
                    .size(b.size)
            })
            .collect_vec();
        unsafe {
            device.device.cmd_pipeline_barrier(
                self.handle,
                BARRIER_STAGES,
                BARRIER_STAGES,
                vk::DependencyFlags::empty(),
                &memory_barriers,
                &buffer_memory_barriers,
                &[],
            )
        };
    }

    pub fn reset_timestamps(&mut self, device: &VulkanDevice, offset: u32, count: u32) {
        unsafe { device.device.cmd_reset_query_pool(self.handle, device.timestamp_pool, offset, count) };
    }

    pub fn write_timestamp(&mut self, device: &VulkanDevice, index: u32) {
        unsafe {
            device.device.cmd_write_timestamp(
                self.handle,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                device.timestamp_pool,
                index,
            )
        };
    }

    pub fn copy_timestamps(
        &mut self,
        device: &VulkanDevice,
        buffer: &VulkanBuffer,
        offset: u32,
        count: u32,
        wait_until_available: bool,
    ) {
        let mut flags = vk::QueryResultFlags::TYPE_64;
        if wait_until_available {
            flags |= vk::QueryResultFlags::WAIT;
        }
        unsafe {
            device.device.cmd_copy_query_pool_results(
                self.handle,
                device.timestamp_pool,
                offset,
                count,
                buffer.buffer,
                0,
                size_of::<u64>() as vk::DeviceSize,
                flags,
            )
        };
    }
}

// 同步与提交
impl VulkanFence {
    pub fn new(device: &VulkanDevice) -> CgpuResult<Self> {
        let create_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let handle = unsafe { device.device.create_fence(&create_info, None) }.map_err(|_| CgpuError::UnableToCreateFence)?;
        Ok(Self { handle })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.destroy_fence(self.handle, None) };
    }

    pub fn reset(&self, device: &VulkanDevice) -> CgpuResult<()> {
        unsafe { device.device.reset_fences(std::slice::from_ref(&self.handle)) }.map_err(|_| CgpuError::UnableToResetFence)
    }

    pub fn wait(&self, device: &VulkanDevice) -> CgpuResult<()> {
        let _span = tracy_client::span!("VulkanFence::wait");
        unsafe { device.device.wait_for_fences(std::slice::from_ref(&self.handle), true, u64::MAX) }
            .map_err(|_| CgpuError::UnableToWaitForFence)
    }

    pub fn submit(&self, device: &VulkanDevice, command_buffer: &VulkanCommandBuffer) -> CgpuResult<()> {
        let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer.handle));
        unsafe { device.device.queue_submit(device.queue, std::slice::from_ref(&submit_info), self.handle) }.map_err(|e| {
            log::error!("vkQueueSubmit failed: {:?}", e);
            CgpuError::UnableToSubmitCommandBuffer
        })
    }
}
