//! 后端接缝
//!
//! `CgpuContext` 负责 handle、对象表以及参数校验，后端只处理已经解析好的原生对象。
//! 生产环境使用 `VulkanBackend`，测试使用在主机内存上模拟执行的 `EmulatedBackend`。

use std::ptr::NonNull;

use crate::basic::desc::{
    BufferBinding, BufferDesc, BufferImageCopyDesc, ImageBinding, ImageDesc, MemoryBarrier, ResolvedBufferBarrier,
};
use crate::basic::limits::DeviceLimits;
use crate::error::CgpuResult;

pub trait GpuBackend {
    type Device;
    type Buffer;
    type Image;
    type Shader;
    type Pipeline;
    type CommandBuffer;
    type Fence;

    fn name(&self) -> &'static str;

    // 设备
    fn physical_device_count(&self) -> CgpuResult<u32>;
    fn create_device(&self, index: u32, required_extensions: &[String]) -> CgpuResult<Self::Device>;
    fn destroy_device(&self, device: Self::Device);
    fn device_limits(&self, device: &Self::Device) -> DeviceLimits;

    // buffer
    fn create_buffer(&self, device: &Self::Device, desc: &BufferDesc) -> CgpuResult<Self::Buffer>;
    fn destroy_buffer(&self, device: &Self::Device, buffer: Self::Buffer);
    fn map_buffer(&self, device: &Self::Device, buffer: &mut Self::Buffer) -> CgpuResult<NonNull<u8>>;
    fn unmap_buffer(&self, device: &Self::Device, buffer: &mut Self::Buffer);
    /// `size` 已经展开，不会是 `WHOLE_SIZE`
    fn flush_mapped_memory(&self, device: &Self::Device, buffer: &Self::Buffer, offset: u64, size: u64)
    -> CgpuResult<()>;
    fn invalidate_mapped_memory(
        &self,
        device: &Self::Device,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
    ) -> CgpuResult<()>;

    // image
    fn create_image(&self, device: &Self::Device, desc: &ImageDesc) -> CgpuResult<Self::Image>;
    fn destroy_image(&self, device: &Self::Device, image: Self::Image);
    fn map_image(&self, device: &Self::Device, image: &mut Self::Image) -> CgpuResult<NonNull<u8>>;
    fn unmap_image(&self, device: &Self::Device, image: &mut Self::Image);

    // shader 与 pipeline
    fn create_shader(&self, device: &Self::Device, spirv: &[u8]) -> CgpuResult<Self::Shader>;
    fn destroy_shader(&self, device: &Self::Device, shader: Self::Shader);
    /// 只为带 `WRITE` 标记的资源写入 descriptor
    fn create_pipeline(
        &self,
        device: &Self::Device,
        shader: &Self::Shader,
        buffers: &[BufferBinding<'_, Self::Buffer>],
        images: &[ImageBinding<'_, Self::Image>],
        push_constants_size: u32,
    ) -> CgpuResult<Self::Pipeline>;
    /// 为任意绑定写入 descriptor，用于补上只读资源
    fn update_pipeline_bindings(
        &self,
        device: &Self::Device,
        pipeline: &mut Self::Pipeline,
        buffers: &[BufferBinding<'_, Self::Buffer>],
        images: &[ImageBinding<'_, Self::Image>],
    ) -> CgpuResult<()>;
    fn destroy_pipeline(&self, device: &Self::Device, pipeline: Self::Pipeline);

    // command buffer
    fn create_command_buffer(&self, device: &Self::Device) -> CgpuResult<Self::CommandBuffer>;
    fn destroy_command_buffer(&self, device: &Self::Device, command_buffer: Self::CommandBuffer);
    fn begin_command_buffer(&self, device: &Self::Device, command_buffer: &mut Self::CommandBuffer) -> CgpuResult<()>;
    fn end_command_buffer(&self, device: &Self::Device, command_buffer: &mut Self::CommandBuffer) -> CgpuResult<()>;

    // 命令录制，参数的范围检查已经由 context 完成
    fn cmd_bind_pipeline(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        pipeline: &Self::Pipeline,
    ) -> CgpuResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn cmd_copy_buffer(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> CgpuResult<()>;
    fn cmd_update_buffer(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        data: &[u8],
        dst: &Self::Buffer,
        dst_offset: u64,
    ) -> CgpuResult<()>;
    /// 首次拷贝时把 image 转换到 general layout
    fn cmd_copy_buffer_to_image(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        src: &Self::Buffer,
        dst: &mut Self::Image,
        region: &BufferImageCopyDesc,
    ) -> CgpuResult<()>;
    fn cmd_push_constants(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        pipeline: &Self::Pipeline,
        data: &[u8],
    ) -> CgpuResult<()>;
    fn cmd_dispatch(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        group_count: [u32; 3],
    ) -> CgpuResult<()>;
    fn cmd_pipeline_barrier(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        barriers: &[MemoryBarrier],
        buffer_barriers: &[ResolvedBufferBarrier<'_, Self::Buffer>],
    ) -> CgpuResult<()>;
    fn cmd_reset_timestamps(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        offset: u32,
        count: u32,
    ) -> CgpuResult<()>;
    fn cmd_write_timestamp(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        index: u32,
    ) -> CgpuResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn cmd_copy_timestamps(
        &self,
        device: &Self::Device,
        command_buffer: &mut Self::CommandBuffer,
        buffer: &Self::Buffer,
        offset: u32,
        count: u32,
        wait_until_available: bool,
    ) -> CgpuResult<()>;

    // 同步与提交
    /// 新建的 fence 处于 signaled 状态
    fn create_fence(&self, device: &Self::Device) -> CgpuResult<Self::Fence>;
    fn destroy_fence(&self, device: &Self::Device, fence: Self::Fence);
    fn reset_fence(&self, device: &Self::Device, fence: &Self::Fence) -> CgpuResult<()>;
    /// 无限等待，没有取消路径
    fn wait_for_fence(&self, device: &Self::Device, fence: &Self::Fence) -> CgpuResult<()>;
    fn submit_command_buffer(
        &self,
        device: &Self::Device,
        command_buffer: &Self::CommandBuffer,
        fence: &Self::Fence,
    ) -> CgpuResult<()>;

    /// 销毁后端实例，此时所有设备都已经销毁
    fn destroy_instance(&mut self);
}
