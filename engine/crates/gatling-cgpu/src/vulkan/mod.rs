//! 基于 ash 的 Vulkan 后端
//!
//! 每个逻辑设备只有一个同时支持 compute 与 transfer 的队列。

pub mod commands;
pub mod device;
pub mod pipeline;
pub mod resources;

use std::ffi::{CStr, CString};
use std::ptr::NonNull;

use ash::vk;

use crate::backend::GpuBackend;
use crate::basic::desc::{
    BufferBinding, BufferDesc, BufferImageCopyDesc, ImageBinding, ImageDesc, MemoryBarrier, ResolvedBufferBarrier,
};
use crate::basic::limits::DeviceLimits;
use crate::context::AppInfo;
use crate::error::{CgpuError, CgpuResult};
use crate::vulkan::commands::{VulkanCommandBuffer, VulkanFence};
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::pipeline::{VulkanPipeline, VulkanShader};
use crate::vulkan::resources::{VulkanBuffer, VulkanImage};

/// 支持枚举的物理设备上限
pub const MAX_PHYSICAL_DEVICES: usize = 32;

pub struct VulkanBackend {
    /// instance 销毁之前 entry 必须一直存活
    _entry: ash::Entry,
    instance: Option<ash::Instance>,
    physical_devices: Vec<vk::PhysicalDevice>,
}

// 创建与销毁
impl VulkanBackend {
    pub fn new(app_info: &AppInfo) -> CgpuResult<Self> {
        let _span = tracy_client::span!("VulkanBackend::new");

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            log::error!("failed to load vulkan loader: {}", e);
            CgpuError::UnableToInitializeVulkan
        })?;

        let instance_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(|_| CgpuError::UnableToInitializeVulkan)?
            .unwrap_or(vk::API_VERSION_1_0);
        if instance_version < vk::API_VERSION_1_1 {
            log::error!(
                "vulkan instance version {}.{} is too old",
                vk::api_version_major(instance_version),
                vk::api_version_minor(instance_version)
            );
            return Err(CgpuError::VkVersionNotSupported);
        }

        let app_name = CString::new(app_info.name.as_str()).map_err(|_| CgpuError::UnableToInitializeVulkan)?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(
                0,
                app_info.version_major,
                app_info.version_minor,
                app_info.version_patch,
            ))
            .engine_name(c"gatling")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // macOS 上的 MoltenVK 需要开启 portability enumeration 才能被枚举到
        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|_| CgpuError::UnableToInitializeVulkan)?;
        let portability: &CStr = ash::khr::portability_enumeration::NAME;
        let has_portability = available_exts.iter().any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == portability));
        let mut instance_exts = Vec::new();
        let mut flags = vk::InstanceCreateFlags::empty();
        if has_portability {
            instance_exts.push(portability.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_extension_names(&instance_exts)
            .flags(flags);
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            log::error!("vkCreateInstance failed: {:?}", e);
            CgpuError::UnableToInitializeVulkan
        })?;
        let instance = scopeguard::guard(instance, |instance| unsafe { instance.destroy_instance(None) });

        let physical_devices =
            unsafe { instance.enumerate_physical_devices() }.map_err(|_| CgpuError::UnableToInitializeVulkan)?;
        if physical_devices.len() > MAX_PHYSICAL_DEVICES {
            log::error!("{} physical devices found, at most {} supported", physical_devices.len(), MAX_PHYSICAL_DEVICES);
            return Err(CgpuError::MaxPhysicalDevicesReached);
        }
        log::info!("vulkan instance created, {} physical device(s)", physical_devices.len());

        Ok(Self {
            _entry: entry,
            instance: Some(scopeguard::ScopeGuard::into_inner(instance)),
            physical_devices,
        })
    }

    #[inline]
    fn instance(&self) -> CgpuResult<&ash::Instance> {
        self.instance.as_ref().ok_or(CgpuError::UnableToInitializeVulkan)
    }
}

impl GpuBackend for VulkanBackend {
    type Device = VulkanDevice;
    type Buffer = VulkanBuffer;
    type Image = VulkanImage;
    type Shader = VulkanShader;
    type Pipeline = VulkanPipeline;
    type CommandBuffer = VulkanCommandBuffer;
    type Fence = VulkanFence;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn physical_device_count(&self) -> CgpuResult<u32> {
        Ok(self.physical_devices.len() as u32)
    }

    fn create_device(&self, index: u32, required_extensions: &[String]) -> CgpuResult<VulkanDevice> {
        let physical_device = *self.physical_devices.get(index as usize).ok_or(CgpuError::NoDeviceAtIndex(index))?;
        VulkanDevice::new(self.instance()?, physical_device, required_extensions)
    }

    fn destroy_device(&self, device: VulkanDevice) {
        device.destroy();
    }

    fn device_limits(&self, device: &VulkanDevice) -> DeviceLimits {
        device.limits
    }

    fn create_buffer(&self, device: &VulkanDevice, desc: &BufferDesc) -> CgpuResult<VulkanBuffer> {
        VulkanBuffer::new(device, desc)
    }

    fn destroy_buffer(&self, device: &VulkanDevice, buffer: VulkanBuffer) {
        buffer.destroy(device);
    }

    fn map_buffer(&self, device: &VulkanDevice, buffer: &mut VulkanBuffer) -> CgpuResult<NonNull<u8>> {
        buffer.map(device)
    }

    fn unmap_buffer(&self, device: &VulkanDevice, buffer: &mut VulkanBuffer) {
        buffer.unmap(device);
    }

    fn flush_mapped_memory(&self, device: &VulkanDevice, buffer: &VulkanBuffer, offset: u64, size: u64) -> CgpuResult<()> {
        buffer.flush(device, offset, size)
    }

    fn invalidate_mapped_memory(
        &self,
        device: &VulkanDevice,
        buffer: &VulkanBuffer,
        offset: u64,
        size: u64,
    ) -> CgpuResult<()> {
        buffer.invalidate(device, offset, size)
    }

    fn create_image(&self, device: &VulkanDevice, desc: &ImageDesc) -> CgpuResult<VulkanImage> {
        VulkanImage::new(device, desc)
    }

    fn destroy_image(&self, device: &VulkanDevice, image: VulkanImage) {
        image.destroy(device);
    }

    fn map_image(&self, device: &VulkanDevice, image: &mut VulkanImage) -> CgpuResult<NonNull<u8>> {
        image.map(device)
    }

    fn unmap_image(&self, device: &VulkanDevice, image: &mut VulkanImage) {
        image.unmap(device);
    }

    fn create_shader(&self, device: &VulkanDevice, spirv: &[u8]) -> CgpuResult<VulkanShader> {
        VulkanShader::new(device, spirv)
    }

    fn destroy_shader(&self, device: &VulkanDevice, shader: VulkanShader) {
        shader.destroy(device);
    }

    fn create_pipeline(
        &self,
        device: &VulkanDevice,
        shader: &VulkanShader,
        buffers: &[BufferBinding<'_, VulkanBuffer>],
        images: &[ImageBinding<'_, VulkanImage>],
        push_constants_size: u32,
    ) -> CgpuResult<VulkanPipeline> {
        VulkanPipeline::new(device, shader, buffers, images, push_constants_size)
    }

    fn update_pipeline_bindings(
        &self,
        device: &VulkanDevice,
        pipeline: &mut VulkanPipeline,
        buffers: &[BufferBinding<'_, VulkanBuffer>],
        images: &[ImageBinding<'_, VulkanImage>],
    ) -> CgpuResult<()> {
        pipeline.update_bindings(device, buffers, images);
        Ok(())
    }

    fn destroy_pipeline(&self, device: &VulkanDevice, pipeline: VulkanPipeline) {
        pipeline.destroy(device);
    }

    fn create_command_buffer(&self, device: &VulkanDevice) -> CgpuResult<VulkanCommandBuffer> {
        VulkanCommandBuffer::new(device)
    }

    fn destroy_command_buffer(&self, device: &VulkanDevice, command_buffer: VulkanCommandBuffer) {
        command_buffer.destroy(device);
    }

    fn begin_command_buffer(&self, device: &VulkanDevice, command_buffer: &mut VulkanCommandBuffer) -> CgpuResult<()> {
        command_buffer.begin(device)
    }

    fn end_command_buffer(&self, device: &VulkanDevice, command_buffer: &mut VulkanCommandBuffer) -> CgpuResult<()> {
        command_buffer.end(device)
    }

    fn cmd_bind_pipeline(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        pipeline: &VulkanPipeline,
    ) -> CgpuResult<()> {
        command_buffer.bind_pipeline(device, pipeline);
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        src: &VulkanBuffer,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) -> CgpuResult<()> {
        command_buffer.copy_buffer(device, src, src_offset, dst, dst_offset, size);
        Ok(())
    }

    fn cmd_update_buffer(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        data: &[u8],
        dst: &VulkanBuffer,
        dst_offset: u64,
    ) -> CgpuResult<()> {
        command_buffer.update_buffer(device, data, dst, dst_offset);
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        src: &VulkanBuffer,
        dst: &mut VulkanImage,
        region: &BufferImageCopyDesc,
    ) -> CgpuResult<()> {
        command_buffer.copy_buffer_to_image(device, src, dst, region);
        Ok(())
    }

    fn cmd_push_constants(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        pipeline: &VulkanPipeline,
        data: &[u8],
    ) -> CgpuResult<()> {
        command_buffer.push_constants(device, pipeline, data);
        Ok(())
    }

    fn cmd_dispatch(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        group_count: [u32; 3],
    ) -> CgpuResult<()> {
        command_buffer.dispatch(device, group_count);
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        barriers: &[MemoryBarrier],
        buffer_barriers: &[ResolvedBufferBarrier<'_, VulkanBuffer>],
    ) -> CgpuResult<()> {
        command_buffer.pipeline_barrier(device, barriers, buffer_barriers);
        Ok(())
    }

    fn cmd_reset_timestamps(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        offset: u32,
        count: u32,
    ) -> CgpuResult<()> {
        command_buffer.reset_timestamps(device, offset, count);
        Ok(())
    }

    fn cmd_write_timestamp(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        index: u32,
    ) -> CgpuResult<()> {
        command_buffer.write_timestamp(device, index);
        Ok(())
    }

    fn cmd_copy_timestamps(
        &self,
        device: &VulkanDevice,
        command_buffer: &mut VulkanCommandBuffer,
        buffer: &VulkanBuffer,
        offset: u32,
        count: u32,
        wait_until_available: bool,
    ) -> CgpuResult<()> {
        command_buffer.copy_timestamps(device, buffer, offset, count, wait_until_available);
        Ok(())
    }

    fn create_fence(&self, device: &VulkanDevice) -> CgpuResult<VulkanFence> {
        VulkanFence::new(device)
    }

    fn destroy_fence(&self, device: &VulkanDevice, fence: VulkanFence) {
        fence.destroy(device);
    }

    fn reset_fence(&self, device: &VulkanDevice, fence: &VulkanFence) -> CgpuResult<()> {
        fence.reset(device)
    }

    fn wait_for_fence(&self, device: &VulkanDevice, fence: &VulkanFence) -> CgpuResult<()> {
        fence.wait(device)
    }

    fn submit_command_buffer(
        &self,
        device: &VulkanDevice,
        command_buffer: &VulkanCommandBuffer,
        fence: &VulkanFence,
    ) -> CgpuResult<()> {
        fence.submit(device, command_buffer)
    }

    fn destroy_instance(&mut self) {
        if let Some(instance) = self.instance.take() {
            log::info!("destroying vulkan instance");
            unsafe { instance.destroy_instance(None) };
        }
    }
}
