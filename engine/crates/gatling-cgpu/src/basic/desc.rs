//! 创建资源与录制命令时使用的描述结构

use crate::basic::flags::{AccessFlags, BufferUsage, ImageUsage, MemoryProperties, ResourceAccess};
use crate::basic::format::ImageFormat;
use crate::handle::typed::{BufferHandle, ImageHandle, ShaderHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_properties: MemoryProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub is_3d: bool,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub memory_properties: MemoryProperties,
}

impl ImageDesc {
    /// 2D RGBA8 纹理，用于采样并从 stager 上传
    pub fn texture_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            is_3d: false,
            format: ImageFormat::R8G8B8A8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        }
    }

    /// texel 数据的总字节数
    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth.max(1) as u64 * self.format.texel_size()
    }
}

/// shader 中以 storage buffer 方式绑定的 buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceBuffer {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `WHOLE_SIZE` 表示 offset 之后的全部内容
    pub size: u64,
    pub access: ResourceAccess,
}

/// shader 中以 storage image 方式绑定的 image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceImage {
    pub binding: u32,
    pub image: ImageHandle,
    pub access: ResourceAccess,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub shader: ShaderHandle,
    pub buffers: &'a [ShaderResourceBuffer],
    pub images: &'a [ShaderResourceImage],
    pub push_constants_size: u32,
}

/// 全局内存屏障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    pub buffer: BufferHandle,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub offset: u64,
    pub size: u64,
}

/// buffer 到 image 的拷贝区域，buffer 中的数据按 extent 紧密排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferImageCopyDesc {
    pub buffer_offset: u64,
    pub texel_offset_x: u32,
    pub texel_offset_y: u32,
    pub texel_offset_z: u32,
    pub texel_extent_x: u32,
    pub texel_extent_y: u32,
    pub texel_extent_z: u32,
}

/// 后端拿到的已解析 buffer 绑定
pub struct BufferBinding<'a, T> {
    pub binding: u32,
    pub native: &'a T,
    pub offset: u64,
    /// 已经把 `WHOLE_SIZE` 展开为实际大小
    pub size: u64,
    pub access: ResourceAccess,
}

pub struct ImageBinding<'a, T> {
    pub binding: u32,
    pub native: &'a T,
    pub access: ResourceAccess,
}

pub struct ResolvedBufferBarrier<'a, T> {
    pub native: &'a T,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub offset: u64,
    pub size: u64,
}
