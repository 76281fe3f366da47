use std::ptr::NonNull;

use gatling_cgpu::{
    BufferHandle, BufferImageCopyDesc, CgpuContext, CommandBufferHandle, DeviceHandle, FenceHandle, GpuBackend,
    ImageHandle,
};

use crate::config::StagerConfig;
use crate::error::{GgpuError, GgpuResult};
use crate::stager::{
    IMAGE_COPY_ALIGNMENT, Stager, StagingArea, StagingResources, StagingState, align_up, create_staging_buffer,
    stage_buffer_chunks, stage_image_rows, validate_image_upload,
};

/// 单块 staging buffer，每次 flush 提交后立即等待 fence
pub struct SyncStager {
    device: DeviceHandle,
    buffer: BufferHandle,
    mapped: NonNull<u8>,
    size: u64,

    command_buffer: CommandBufferHandle,
    fence: FenceHandle,

    state: StagingState,
    inline_update_limit: u64,

    destroyed: bool,
}

// 创建与销毁
impl SyncStager {
    pub fn allocate<B: GpuBackend>(
        ctx: &mut CgpuContext<B>,
        device: DeviceHandle,
        config: &StagerConfig,
    ) -> GgpuResult<Self> {
        let _span = tracy_client::span!("SyncStager::allocate");

        let mut resources = StagingResources::default();
        match Self::create(ctx, device, config, &mut resources) {
            Ok(stager) => {
                log::trace!("sync stager allocated, {} bytes", stager.size);
                Ok(stager)
            }
            Err(e) => {
                log::error!("failed to allocate sync stager: {}", e);
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
        let buffer = create_staging_buffer(ctx, device, config.buffer_size)?;
        resources.buffer = Some(buffer);
        let command_buffer = ctx.create_command_buffer(device)?;
        resources.command_buffers.push(command_buffer);
        let fence = ctx.create_fence(device)?;
        resources.fences.push(fence);

        let mapped = ctx.map_buffer(buffer)?;
        ctx.begin_command_buffer(command_buffer)?;

        let limits = ctx.device_limits(device)?;
        Ok(Self {
            device,
            buffer,
            mapped,
            size: config.buffer_size,
            command_buffer,
            fence,
            state: StagingState::default(),
            inline_update_limit: config.inline_update_threshold.min(limits.max_buffer_update_size),
            destroyed: false,
        })
    }
}

impl Drop for SyncStager {
    fn drop(&mut self) {
        debug_assert!(self.destroyed, "SyncStager must be freed before drop");
    }
}

// getters
impl SyncStager {
    #[inline]
    pub fn device(&self) -> DeviceHandle {
        self.device
    }
}

impl<B: GpuBackend> StagingArea<B> for SyncStager {
    fn region_capacity(&self) -> u64 {
        self.size
    }

    fn region_base(&self) -> u64 {
        0
    }

    fn staging_buffer(&self) -> BufferHandle {
        self.buffer
    }

    fn mapped(&self) -> NonNull<u8> {
        self.mapped
    }

    fn recording_command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
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
        let _span = tracy_client::span!("SyncStager::flush");

        ctx.reset_fence(self.fence)?;
        ctx.end_command_buffer(self.command_buffer)?;
        if self.state.staged_bytes > 0 {
            ctx.flush_mapped_memory(self.buffer, 0, self.state.staged_bytes)?;
        }
        ctx.submit_command_buffer(self.command_buffer, self.fence)?;
        ctx.wait_for_fence(self.fence)?;
        log::trace!("sync stager flushed {} bytes", self.state.staged_bytes);

        self.state = StagingState::default();
        ctx.begin_command_buffer(self.command_buffer)?;
        Ok(())
    }
}

impl<B: GpuBackend> Stager<B> for SyncStager {
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

    /// 整张 image 放得下时只录制一个拷贝区域，否则按行分批
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

        let desc = ctx.image_desc(dst)?;
        validate_image_upload(&desc, src, width, height, depth)?;

        let total = src.len() as u64;
        let mut offset = align_up(self.state.staged_bytes, IMAGE_COPY_ALIGNMENT);
        if total > self.size {
            return stage_image_rows(self, ctx, src, dst, width, height, depth);
        }
        if offset + total > self.size {
            self.flush_region(ctx)?;
            offset = 0;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.mapped.as_ptr().add(offset as usize), src.len());
        }
        let region = BufferImageCopyDesc {
            buffer_offset: offset,
            texel_extent_x: width,
            texel_extent_y: height,
            texel_extent_z: depth,
            ..Default::default()
        };
        ctx.cmd_copy_buffer_to_image(self.command_buffer, self.buffer, dst, &region)?;
        self.state.staged_bytes = offset + total;
        self.state.commands_pending = true;
        Ok(())
    }

    fn flush(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        self.flush_region(ctx)
    }

    fn wait_idle(&mut self, _ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        // flush 已经同步等待
        Ok(())
    }

    fn free(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if self.destroyed {
            return Err(GgpuError::StagerNotAllocated);
        }
        debug_assert!(self.state.is_idle(), "SyncStager freed with unflushed data");
        if !self.state.is_idle() {
            log::error!("freeing sync stager with {} unflushed bytes", self.state.staged_bytes);
        }

        ctx.end_command_buffer(self.command_buffer)?;
        ctx.unmap_buffer(self.buffer)?;
        let resources = StagingResources {
            buffer: Some(self.buffer),
            command_buffers: vec![self.command_buffer],
            fences: vec![self.fence],
        };
        resources.release(ctx);

        self.state = StagingState::default();
        self.destroyed = true;
        log::trace!("sync stager freed");
        Ok(())
    }

    fn staged_bytes(&self) -> u64 {
        self.state.staged_bytes
    }

    fn capacity(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestGpu, pattern};
    use gatling_cgpu::{EmulatedBackend, ImageDesc};

    fn config(buffer_size: u64) -> StagerConfig {
        StagerConfig {
            kind: crate::config::StagerKind::Synchronous,
            buffer_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_flush_is_synchronous() {
        let mut gpu = TestGpu::new();
        let mut stager = SyncStager::allocate(&mut gpu.ctx, gpu.device, &config(1 << 20)).unwrap();
        let dst = gpu.device_local_buffer(200_000);
        let src = pattern(b"GATLING", 200_000);

        stager.stage_to_buffer(&mut gpu.ctx, &src, dst, 0).unwrap();
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 200_000);
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();

        // 不需要额外等待
        assert_eq!(gpu.contents(dst), src);
        assert_eq!(gpu.stats().submits(), 1);
        assert_eq!(gpu.stats().fence_waits(), 1);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_exact_capacity_triggers_one_flush() {
        let mut gpu = TestGpu::new();
        let mut stager = SyncStager::allocate(&mut gpu.ctx, gpu.device, &config(1 << 17)).unwrap();
        let capacity = Stager::<EmulatedBackend>::capacity(&stager);
        let dst = gpu.device_local_buffer(capacity);
        let src = pattern(b"GATLING", capacity as usize);

        stager.stage_to_buffer(&mut gpu.ctx, &src, dst, 0).unwrap();
        assert_eq!(gpu.stats().submits(), 1);
        assert_eq!(gpu.stats().fence_waits(), 1);
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 0);
        assert_eq!(gpu.contents(dst), src);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut gpu = TestGpu::new();
        let mut stager = SyncStager::allocate(&mut gpu.ctx, gpu.device, &config(1 << 20)).unwrap();
        let dst = gpu.device_local_buffer(100_000);

        stager.stage_to_buffer(&mut gpu.ctx, &pattern(b"GATLING", 100_000), dst, 0).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        let submits = gpu.stats().submits();
        let waits = gpu.stats().fence_waits();
        let resets = gpu.stats().fence_resets();
        assert_eq!(submits, 1);

        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.stats().submits(), submits);
        assert_eq!(gpu.stats().fence_waits(), waits);
        assert_eq!(gpu.stats().fence_resets(), resets);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_buffer(dst).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_whole_image_in_one_region() {
        let mut gpu = TestGpu::new();
        let mut stager = SyncStager::allocate(&mut gpu.ctx, gpu.device, &config(1 << 20)).unwrap();
        let image = gpu.ctx.create_image(gpu.device, &ImageDesc::texture_2d(32, 32)).unwrap();
        let src = pattern(b"GATLING", 32 * 32 * 4);

        stager.stage_to_image(&mut gpu.ctx, &src, image, 32, 32, 1).unwrap();
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&stager), 32 * 32 * 4);

        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.image_contents(image), src);
        assert_eq!(gpu.stats().submits(), 1);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_image_larger_than_buffer_uses_rows() {
        let mut gpu = TestGpu::new();
        let mut stager = SyncStager::allocate(&mut gpu.ctx, gpu.device, &config(1024)).unwrap();
        let image = gpu.ctx.create_image(gpu.device, &ImageDesc::texture_2d(16, 40)).unwrap();
        let src = pattern(b"GATLING", 16 * 40 * 4);

        stager.stage_to_image(&mut gpu.ctx, &src, image, 16, 40, 1).unwrap();
        Stager::flush(&mut stager, &mut gpu.ctx).unwrap();
        assert_eq!(gpu.image_contents(image), src);
        assert_eq!(gpu.stats().submits(), 3);

        Stager::free(&mut stager, &mut gpu.ctx).unwrap();
        gpu.ctx.destroy_image(image).unwrap();
        gpu.shutdown();
    }
}
