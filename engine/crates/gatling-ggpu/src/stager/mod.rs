//! 主机内存到设备资源的传输通道
//!
//! 小块写入被合并进 staging buffer 中，每次 flush 只提交一次拷贝命令。两种实现共用同一套分块逻辑，
//! 区别只在“可写区域”的划分以及 flush 是否同步等待。
//!
//! 一次 `stage_to_*` 失败时，已经通过内部 flush 提交的分块仍会写入目标资源，此时目标区间的内容不确定，
//! 调用方需要在恢复后重新上传整个区间。

mod double_buffered;
mod sync;

pub use double_buffered::DoubleBufferedStager;
pub use sync::SyncStager;

use std::ptr::NonNull;

use gatling_cgpu::{
    BufferDesc, BufferHandle, BufferImageCopyDesc, BufferUsage, CgpuContext, CommandBufferHandle, DeviceHandle,
    FenceHandle, GpuBackend, ImageDesc, ImageHandle, MemoryProperties,
};

use crate::config::{StagerConfig, StagerKind};
use crate::error::{GgpuError, GgpuResult};

/// buffer 到 image 拷贝时 staging 内偏移的对齐，覆盖所有 texel 大小
const IMAGE_COPY_ALIGNMENT: u64 = 16;

pub trait Stager<B: GpuBackend> {
    /// 把 src 上传到 dst 的 dst_offset 处；可写区域写满时自动 flush
    fn stage_to_buffer(
        &mut self,
        ctx: &mut CgpuContext<B>,
        src: &[u8],
        dst: BufferHandle,
        dst_offset: u64,
    ) -> GgpuResult<()>;

    /// src 按行紧密排列，行大小超过可写区域容量时直接失败，不录制任何命令
    fn stage_to_image(
        &mut self,
        ctx: &mut CgpuContext<B>,
        src: &[u8],
        dst: ImageHandle,
        width: u32,
        height: u32,
        depth: u32,
    ) -> GgpuResult<()>;

    /// 提交已经录制的拷贝；没有暂存数据也没有待提交命令时什么都不做
    fn flush(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()>;

    /// 等待所有已提交的拷贝在设备上执行完毕
    fn wait_idle(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()>;

    /// 必须在所属设备销毁之前调用
    fn free(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()>;

    fn staged_bytes(&self) -> u64;

    /// 一个可写区域的容量
    fn capacity(&self) -> u64;
}

/// 根据配置创建 stager
pub fn create_stager<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    config: &StagerConfig,
) -> GgpuResult<Box<dyn Stager<B>>> {
    Ok(match config.kind {
        StagerKind::DoubleBuffered => Box::new(DoubleBufferedStager::allocate(ctx, device, config)?),
        StagerKind::Synchronous => Box::new(SyncStager::allocate(ctx, device, config)?),
    })
}

// 两种 stager 共用的实现

/// 当前可写区域的使用情况
#[derive(Debug, Default)]
pub(crate) struct StagingState {
    pub staged_bytes: u64,
    /// 录制过但还没提交的命令，包括不占用 staging 空间的 inline update
    pub commands_pending: bool,
}

impl StagingState {
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.staged_bytes == 0 && !self.commands_pending
    }
}

pub(crate) trait StagingArea<B: GpuBackend> {
    fn region_capacity(&self) -> u64;
    /// 可写区域在 staging buffer 中的起始偏移
    fn region_base(&self) -> u64;
    fn staging_buffer(&self) -> BufferHandle;
    fn mapped(&self) -> NonNull<u8>;
    fn recording_command_buffer(&self) -> CommandBufferHandle;
    fn inline_update_limit(&self) -> u64;
    fn state(&self) -> &StagingState;
    fn state_mut(&mut self) -> &mut StagingState;
    fn flush_region(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()>;
}

/// allocate 过程中已经创建的对象，失败时统一销毁
#[derive(Default)]
pub(crate) struct StagingResources {
    pub buffer: Option<BufferHandle>,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub fences: Vec<FenceHandle>,
}

impl StagingResources {
    pub fn release<B: GpuBackend>(self, ctx: &mut CgpuContext<B>) {
        for fence in self.fences {
            if let Err(e) = ctx.destroy_fence(fence) {
                log::warn!("failed to destroy staging fence: {}", e);
            }
        }
        for command_buffer in self.command_buffers {
            if let Err(e) = ctx.destroy_command_buffer(command_buffer) {
                log::warn!("failed to destroy staging command buffer: {}", e);
            }
        }
        if let Some(buffer) = self.buffer {
            if let Err(e) = ctx.destroy_buffer(buffer) {
                log::warn!("failed to destroy staging buffer: {}", e);
            }
        }
    }
}

/// 优先使用 device local 且 host visible 的内存，没有时退回 host cached
pub(crate) fn create_staging_buffer<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    size: u64,
) -> GgpuResult<BufferHandle> {
    let mut desc = BufferDesc {
        size,
        usage: BufferUsage::TRANSFER_SRC,
        memory_properties: MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE,
    };
    match ctx.create_buffer(device, &desc) {
        Ok(buffer) => Ok(buffer),
        Err(e) => {
            log::debug!("device local staging memory unavailable ({}), falling back to host cached", e);
            desc.memory_properties = MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_CACHED;
            Ok(ctx.create_buffer(device, &desc)?)
        }
    }
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// 把 data 拷进可写区域的 region_offset 处，返回它在 staging buffer 中的绝对偏移
fn copy_into_region<B: GpuBackend, S: StagingArea<B>>(area: &S, region_offset: u64, data: &[u8]) -> u64 {
    assert!(region_offset + data.len() as u64 <= area.region_capacity());
    let staging_offset = area.region_base() + region_offset;
    unsafe {
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            area.mapped().as_ptr().add(staging_offset as usize),
            data.len(),
        );
    }
    staging_offset
}

pub(crate) fn stage_buffer_chunks<B: GpuBackend, S: StagingArea<B>>(
    area: &mut S,
    ctx: &mut CgpuContext<B>,
    src: &[u8],
    dst: BufferHandle,
    dst_offset: u64,
) -> GgpuResult<()> {
    let _span = tracy_client::span!("Stager::stage_to_buffer");
    if src.is_empty() {
        return Ok(());
    }

    let size = src.len() as u64;
    let dst_size = ctx.buffer_size(dst)?;
    if dst_offset.checked_add(size).is_none_or(|end| end > dst_size) {
        return Err(GgpuError::RangeOutOfBounds {
            offset: dst_offset,
            size,
            capacity: dst_size,
        });
    }

    // 小块数据直接写进命令流，不经过 staging buffer
    if size <= area.inline_update_limit() && size % 4 == 0 && dst_offset % 4 == 0 {
        ctx.cmd_update_buffer(area.recording_command_buffer(), src, dst, dst_offset)?;
        area.state_mut().commands_pending = true;
        return Ok(());
    }

    let capacity = area.region_capacity();
    let mut copied = 0u64;
    while copied < size {
        if area.state().staged_bytes == capacity {
            area.flush_region(ctx)?;
        }

        let staged = area.state().staged_bytes;
        let chunk = (size - copied).min(capacity - staged);
        let staging_offset = copy_into_region::<B, S>(area, staged, &src[copied as usize..(copied + chunk) as usize]);
        ctx.cmd_copy_buffer(
            area.recording_command_buffer(),
            area.staging_buffer(),
            staging_offset,
            dst,
            dst_offset + copied,
            chunk,
        )?;

        let state = area.state_mut();
        state.staged_bytes += chunk;
        state.commands_pending = true;
        copied += chunk;

        if area.state().staged_bytes == capacity {
            area.flush_region(ctx)?;
        }
    }
    Ok(())
}

/// 检查上传范围并返回行大小
pub(crate) fn validate_image_upload(
    desc: &ImageDesc,
    src: &[u8],
    width: u32,
    height: u32,
    depth: u32,
) -> GgpuResult<u64> {
    if width == 0
        || height == 0
        || depth == 0
        || width > desc.width
        || height > desc.height
        || depth > desc.depth.max(1)
    {
        log::error!(
            "image upload extent {}x{}x{} does not fit image {}x{}x{}",
            width,
            height,
            depth,
            desc.width,
            desc.height,
            desc.depth
        );
        return Err(GgpuError::InvalidImageExtent);
    }

    let row_size = width as u64 * desc.format.texel_size();
    if src.len() as u64 != row_size * height as u64 * depth as u64 {
        log::error!("image upload expects {} bytes, got {}", row_size * height as u64 * depth as u64, src.len());
        return Err(GgpuError::InvalidImageExtent);
    }
    Ok(row_size)
}

/// 以整行为单位打包，每个 depth slice 单独成批，保证 staging 中的布局与拷贝区域一致
pub(crate) fn stage_image_rows<B: GpuBackend, S: StagingArea<B>>(
    area: &mut S,
    ctx: &mut CgpuContext<B>,
    src: &[u8],
    dst: ImageHandle,
    width: u32,
    height: u32,
    depth: u32,
) -> GgpuResult<()> {
    let _span = tracy_client::span!("Stager::stage_to_image");
    let desc = ctx.image_desc(dst)?;
    let row_size = validate_image_upload(&desc, src, width, height, depth)?;

    let capacity = area.region_capacity();
    if row_size > capacity {
        log::error!("image row of {} bytes does not fit staging capacity {}", row_size, capacity);
        return Err(GgpuError::RowExceedsStagingCapacity { row_size, capacity });
    }

    let slice_size = row_size * height as u64;
    for z in 0..depth {
        let mut rows_staged = 0u32;
        while rows_staged < height {
            let mut offset = align_up(area.state().staged_bytes, IMAGE_COPY_ALIGNMENT);
            if offset + row_size > capacity {
                area.flush_region(ctx)?;
                offset = 0;
            }

            let max_rows = ((capacity - offset) / row_size) as u32;
            let rows = max_rows.min(height - rows_staged);
            let begin = (z as u64 * slice_size + rows_staged as u64 * row_size) as usize;
            let bytes = &src[begin..begin + (rows as u64 * row_size) as usize];

            let staging_offset = copy_into_region::<B, S>(area, offset, bytes);
            let region = BufferImageCopyDesc {
                buffer_offset: staging_offset,
                texel_offset_x: 0,
                texel_offset_y: rows_staged,
                texel_offset_z: z,
                texel_extent_x: width,
                texel_extent_y: rows,
                texel_extent_z: 1,
            };
            ctx.cmd_copy_buffer_to_image(area.recording_command_buffer(), area.staging_buffer(), dst, &region)?;

            let state = area.state_mut();
            state.staged_bytes = offset + bytes.len() as u64;
            state.commands_pending = true;
            rows_staged += rows;

            if area.state().staged_bytes == capacity {
                area.flush_region(ctx)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatling_cgpu::{ImageFormat, ImageUsage};

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(32, 16), 32);
    }

    #[test]
    fn test_validate_image_upload() {
        let desc = ImageDesc {
            width: 8,
            height: 4,
            depth: 1,
            is_3d: false,
            format: ImageFormat::R32Sfloat,
            usage: ImageUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        };
        assert_eq!(validate_image_upload(&desc, &[0; 128], 8, 4, 1), Ok(32));
        assert_eq!(validate_image_upload(&desc, &[0; 127], 8, 4, 1), Err(GgpuError::InvalidImageExtent));
        assert_eq!(validate_image_upload(&desc, &[0; 160], 8, 5, 1), Err(GgpuError::InvalidImageExtent));
        assert_eq!(validate_image_upload(&desc, &[], 0, 4, 1), Err(GgpuError::InvalidImageExtent));
    }
}
