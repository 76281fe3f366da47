use std::ptr::NonNull;

use gatling_cgpu::{BufferHandle, CgpuContext, CommandBufferHandle, DeviceHandle, FenceHandle, GpuBackend, ImageHandle};

use crate::config::StagerConfig;
use crate::error::{GgpuError, GgpuResult};
use crate::stager::{
    IMAGE_COPY_ALIGNMENT, Stager, StagingArea, StagingResources, StagingState, create_staging_buffer,
    stage_buffer_chunks, stage_image_rows,
};

/// 把 staging buffer 分成两半交替使用的 stager
///
/// 一半提交给 GPU 之后，主机立刻开始写另一半。某一半重新变为可写时先等待它上一次提交的 fence，
/// 保证主机不会覆盖 GPU 仍在读取的数据。fence 创建时即处于 signaled 状态，第一次使用不会阻塞。
pub struct DoubleBufferedStager {
    device: DeviceHandle,
    buffer: BufferHandle,
    mapped: NonNull<u8>,
    half_size: u64,

    command_buffers: [CommandBufferHandle; 2],
    fences: [FenceHandle; 2],
    writeable_half: usize,

    state: StagingState,
    inline_update_limit: u64,

    destroyed: bool,
}

// 创建与销毁
impl DoubleBufferedStager {
    pub fn allocate<B: GpuBackend>(
        ctx: &mut CgpuContext<B>,
        device: DeviceHandle,
        config: &StagerConfig,
    ) -> GgpuResult<Self> {
        let _span = tracy_client::span!("DoubleBufferedStager::allocate");

        let mut resources = StagingResources::default();
        match Self::create(ctx, device, config, &mut resources) {
            Ok(stager) => {
                log::trace!("double buffered stager allocated, {} bytes per half", stager.half_size);
                Ok(stager)
            }
            Err(e) => {
                log::error!("failed to allocate double buffered stager: {}", e);
                resources.release(ctx);
                Err(e)
            }
        }
    }

    fn create<B: GpuBackend>(
        ctx: &mut CgpuContext<B>,
        device: DeviceHandle,
        config: &StagerConfig,
        resources: &mut StagingResources,
    ) -> GgpuResult<Self> {
        // 第二个半区的起点也要满足 buffer 到 image 拷贝的偏移对齐
        let half_size = config.buffer_size / 2 / IMAGE_COPY_ALIGNMENT * IMAGE_COPY_ALIGNMENT;
        if half_size == 0 {
            return Err(gatling_cgpu::CgpuError::UnableToCreateBuffer.into());
        }

        let buffer = create_staging_buffer(ctx, device, half_size * 2)?;
        resources.buffer = Some(buffer);
        for _ in 0..2 {
            resources.command_buffers.push(ctx.create_command_buffer(device)?);
        }
        for _ in 0..2 {
            resources.fences.push(ctx.create_fence(device)?);
        }

        let mapped = ctx.map_buffer(buffer)?;
        ctx.begin_command_buffer(resources.command_buffers[0])?;

        let limits = ctx.device_limits(device)?;
        Ok(Self {
            device,
            buffer,
            mapped,
            half_size,
            command_buffers: [resources.command_buffers[0], resources.command_buffers[1]],
            fences: [resources.fences[0], resources.fences[1]],
            writeable_half: 0,
            state: StagingState::default(),
            inline_update_limit: config.inline_update_threshold.min(limits.max_buffer_update_size),
            destroyed: false,
        })
    }
}

impl Drop for DoubleBufferedStager {
    fn drop(&mut self) {
        debug_assert!(self.destroyed, "DoubleBufferedStager must be freed before drop");
    }
}

// getters
impl DoubleBufferedStager {
    #[inline]
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    #[inline]
    pub fn writeable_half(&self) -> usize {
        self.writeable_half
    }

    #[inline]
    pub fn staging_buffer(&self) -> BufferHandle {
        self.buffer
    }
}

impl<B: GpuBackend> StagingArea<B> for DoubleBufferedStager {
    fn region_capacity(&self) -> u64 {
        self.half_size
    }

    fn region_base(&self) -> u64 {
        self.writeable_half as u64 * self.half_size
    }

    fn staging_buffer(&self) -> BufferHandle {
        self.buffer
    }

    fn mapped(&self) -> NonNull<u8> {
        self.mapped
    }

    fn recording_command_buffer(&self) -> CommandBufferHandle {
        self.command_buffers[self.writeable_half]
    }

    fn inline_update_limit(&self) -> u64 {
        self.inline_update_limit
    }

    fn state(&self) -> &StagingState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StagingState {
        &mut self.state
    }

    fn flush_region(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.state.is_idle() {
            return Ok(());
        }
        let _span = tracy_client::span!("DoubleBufferedStager::flush");

        let half = self.writeable_half;
        // 这一半变为可写时已经等待过它的 fence，此时 fence 必然处于 signaled 状态
        ctx.reset_fence(self.fences[half])?;
        ctx.end_command_buffer(self.command_buffers[half])?;
        if self.state.staged_bytes > 0 {
            ctx.flush_mapped_memory(self.buffer, half as u64 * self.half_size, self.state.staged_bytes)?;
        }
        ctx.submit_command_buffer(self.command_buffers[half], self.fences[half])?;
        log::trace!("stager flushed half {} ({} bytes)", half, self.state.staged_bytes);

        self.state = StagingState::default();
        self.writeable_half = 1 - half;

        // 等待新的可写半区上一次提交完成，之后才能覆盖它的内存
        ctx.wait_for_fence(self.fences[self.writeable_half])?;
        ctx.begin_command_buffer(self.command_buffers[self.writeable_half])?;
        Ok(())
    }
}

impl<B: GpuBackend> Stager<B> for DoubleBufferedStager {
    fn stage_to_buffer(
        &mut self,
        ctx: &mut CgpuContext<B>,
        src: &[u8],
        dst: BufferHandle,
        dst_offset: u64,
    ) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        stage_buffer_chunks(self, ctx, src, dst, dst_offset)
    }

    fn stage_to_image(
        &mut self,
        ctx: &mut CgpuContext<B>,
        src: &[u8],
        dst: ImageHandle,
        width: u32,
        height: u32,
        depth: u32,
    ) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        stage_image_rows(self, ctx, src, dst, width, height, depth)
    }

    fn flush(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        self.flush_region(ctx)
    }

    fn wait_idle(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        // 可写半区的 fence 在翻转时已经等待过，只有另一半可能还在执行
        ctx.wait_for_fence(self.fences[1 - self.writeable_half])?;
        Ok(())
    }

    fn free(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        let _span = tracy_client::span!("DoubleBufferedStager::free");
        if !self.state.is_idle() {
            log::warn!("freeing stager with {} unflushed bytes, pending copies are dropped", self.state.staged_bytes);
        }

        ctx.wait_for_fence(self.fences[1 - self.writeable_half])?;
        ctx.end_command_buffer(self.command_buffers[self.writeable_half])?;
        ctx.unmap_buffer(self.buffer)?;

        let resources = StagingResources {
            buffer: Some(self.buffer),
            command_buffers: self.command_buffers.to_vec(),
            fences: self.fences.to_vec(),
        };
        resources.release(ctx);

        self.state = StagingState::default();
        self.destroyed = true;
        log::trace!("double buffered stager freed");
        Ok(())
    }

    fn staged_bytes(&self) -> u64 {
        self.state.staged_bytes
    }

    fn capacity(&self) -> u64 {
        self.half_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestGpu, pattern};
    use gatling_cgpu::{BufferDesc, BufferUsage, EmulatedBackend, ImageDesc, ImageFormat, ImageUsage, MemoryProperties};

    const SMALL_STAGING: u64 = 256 * 1024;

    fn small_config() -> StagerConfig {
        StagerConfig {
            buffer_size: SMALL_STAGING,
            ..Default::default()
        }
    }

    #[test]
    fn test_stage_round_trip() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &StagerConfig::default()).unwrap();
        let dst = gpu
            .ctx
            .create_buffer(
                gpu.device,
                &BufferDesc {
                    size: 1024,
                    usage: BufferUsage::TRANSFER_DST,
                    memory_properties: MemoryProperties::HOST_VISIBLE,
                },
            )
            .unwrap();

        let src = pattern(b"GATLING", 128);
        stager.stage_to_buffer(&mut gpu.ctx, &src, dst, 256).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();

        assert_eq!(gpu.read_mapped(dst, 256, 128), src);
        assert!(gpu.read_mapped(dst, 0, 256).iter().all(|b| *b == 0));

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_large_upload_goes_through_staging() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let dst = gpu.device_local_buffer(300 * 1024);

        // 跨越多个半区，中途自动 flush
        let src = pattern(b"GATLING", 300 * 1024);
        stager.stage_to_buffer(&mut gpu.ctx, &src, dst, 0).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();

        assert_eq!(gpu.contents(dst), src);
        assert_eq!(gpu.stats().submits(), 3);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_exact_half_triggers_one_flush() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let half = Stager::<EmulatedBackend>::capacity(&stager);
        let dst = gpu.device_local_buffer(half);

        stager.stage_to_buffer(&mut gpu.ctx, &pattern(b"GATLING", half as usize), dst, 0).unwrap();
        assert_eq!(gpu.stats().submits(), 1);
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 0);
        assert_eq!(stager.writeable_half(), 1);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let dst = gpu.device_local_buffer(100_000);

        stager.stage_to_buffer(&mut gpu.ctx, &pattern(b"GATLING", 100_000), dst, 0).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), 1);
        let submits = gpu.stats().submits();
        let waits = gpu.stats().fence_waits();

        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), submits);
        assert_eq!(gpu.stats().fence_waits(), waits);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_small_upload_is_inline() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let dst = gpu.device_local_buffer(64);

        stager.stage_to_buffer(&mut gpu.ctx, &[7u8; 16], dst, 16).unwrap();
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 0);

        // 只有 inline update 也需要提交
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), 1);
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(&gpu.contents(dst)[16..32], &[7u8; 16]);

        // 未对齐的小块走 staging buffer
        stager.stage_to_buffer(&mut gpu.ctx, &[9u8; 3], dst, 1).unwrap();
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 3);

        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_out_of_bounds_records_nothing() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let dst = gpu.device_local_buffer(64);

        let result = stager.stage_to_buffer(&mut gpu.ctx, &[1u8; 128], dst, 0);
        assert_eq!(
            result,
            Err(GgpuError::RangeOutOfBounds {
                offset: 0,
                size: 128,
                capacity: 64
            })
        );
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 0);

        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), 0);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_row_too_large_is_rejected() {
        let mut gpu = TestGpu::new();
        let config = StagerConfig {
            buffer_size: 1024,
            ..Default::default()
        };
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &config).unwrap();
        let image = gpu.ctx.create_image(gpu.device, &ImageDesc::texture_2d(256, 2)).unwrap();

        // 一行 1024 字节，大于 512 字节的半区
        let result = stager.stage_to_image(&mut gpu.ctx, &vec![0u8; 2048], image, 256, 2, 1);
        assert_eq!(
            result,
            Err(GgpuError::RowExceedsStagingCapacity {
                row_size: 1024,
                capacity: 512
            })
        );
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 0);
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), 0);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_image_upload_in_row_batches() {
        let mut gpu = TestGpu::new();
        let config = StagerConfig {
            buffer_size: 1024,
            ..Default::default()
        };
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &config).unwrap();
        // 每行 64 字节，每个半区 8 行
        let image = gpu.ctx.create_image(gpu.device, &ImageDesc::texture_2d(16, 20)).unwrap();
        let src = pattern(b"GATLING", 16 * 20 * 4);

        stager.stage_to_image(&mut gpu.ctx, &src, image, 16, 20, 1).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();

        assert_eq!(gpu.stats().submits(), 3);
        assert_eq!(gpu.image_contents(image), src);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_3d_image_upload() {
        let mut gpu = TestGpu::new();
        let config = StagerConfig {
            buffer_size: 4096,
            ..Default::default()
        };
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &config).unwrap();
        let desc = ImageDesc {
            width: 4,
            height: 3,
            depth: 5,
            is_3d: true,
            format: ImageFormat::R32Sfloat,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::STORAGE,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        };
        let image = gpu.ctx.create_image(gpu.device, &desc).unwrap();
        let src = pattern(b"GATLING", 4 * 3 * 5 * 4);

        stager.stage_to_image(&mut gpu.ctx, &src, image, 4, 3, 5).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.image_contents(image), src);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_second_half_image_offset_is_aligned() {
        let mut gpu = TestGpu::new();
        let config = StagerConfig {
            buffer_size: 1000,
            ..Default::default()
        };
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &config).unwrap();
        let half = Stager::<EmulatedBackend>::capacity(&stager);
        assert_eq!(half, 496);

        // 写满第 0 半区再多 1 字节，切换到第 1 半区
        let dst = gpu.device_local_buffer(1024);
        let bytes = pattern(b"GATLING", half as usize + 1);
        stager.stage_to_buffer(&mut gpu.ctx, &bytes, dst, 1).unwrap();
        assert_eq!(stager.writeable_half(), 1);
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 1);

        let desc = ImageDesc {
            width: 2,
            height: 2,
            depth: 1,
            is_3d: false,
            format: ImageFormat::R32G32B32A32Sfloat,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        };
        let image = gpu.ctx.create_image(gpu.device, &desc).unwrap();
        let src = pattern(b"GATLING", 2 * 2 * 16);
        stager.stage_to_image(&mut gpu.ctx, &src, image, 2, 2, 1).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();

        assert_eq!(gpu.image_contents(image), src);
        assert_eq!(&gpu.contents(dst)[1..half as usize + 2], &bytes[..]);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_tiny_buffer_is_rejected() {
        let mut gpu = TestGpu::new();
        let config = StagerConfig {
            buffer_size: 24,
            ..Default::default()
        };
        assert!(DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &config).is_err());
        assert_eq!(gpu.ctx.live_object_count(), 1);
        gpu.shutdown();
    }

    #[test]
    fn test_host_cached_fallback_flushes_memory() {
        let mut gpu = TestGpu::without_rebar();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        let properties = gpu.ctx.buffer_native(stager.staging_buffer()).unwrap().memory_properties();
        assert!(properties.contains(MemoryProperties::HOST_CACHED));

        let dst = gpu.device_local_buffer(1 << 17);
        let src = pattern(b"GATLING", 1 << 17);
        stager.stage_to_buffer(&mut gpu.ctx, &src, dst, 0).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        Stager::wait_idle(&mut stager, &mut gpu.ctx).unwrap();
        assert!(gpu.stats().memory_flushes() > 0);
        assert_eq!(gpu.contents(dst), src);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_free_waits_once_and_unmaps() {
        let mut gpu = TestGpu::new();
        let mut stager = DoubleBufferedStager::allocate(&mut gpu.ctx, gpu.device, &small_config()).unwrap();
        assert_eq!(gpu.stats().live_mappings(), 1);

        let waits = gpu.stats().fence_waits();
        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().fence_waits(), waits + 1);
        assert_eq!(gpu.stats().live_mappings(), 0);
        assert_eq!(gpu.ctx.live_object_count(), 1);

        assert_eq!(
            Stager::flush(&mut stager, &mut gpu.ctx),
            Err(GgpuError::StagerNotAllocated)
        );
        gpu.shutdown();
    }
}
