use gatling_cgpu::{
    BufferHandle, CgpuContext, CommandBufferHandle, FenceHandle, GpuBackend, ImageHandle, PipelineHandle,
    ShaderHandle,
};

use crate::error::GgpuResult;

/// 资源在入队之后至少经过这么多帧才会被销毁
pub const FRAME_COUNT: usize = 4;

/// 等待销毁的资源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingDestroy {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Pipeline(PipelineHandle),
    Shader(ShaderHandle),
    CommandBuffer(CommandBufferHandle),
    Fence(FenceHandle),
}

impl PendingDestroy {
    fn destroy<B: GpuBackend>(self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        match self {
            PendingDestroy::Buffer(h) => ctx.destroy_buffer(h)?,
            PendingDestroy::Image(h) => ctx.destroy_image(h)?,
            PendingDestroy::Pipeline(h) => ctx.destroy_pipeline(h)?,
            PendingDestroy::Shader(h) => ctx.destroy_shader(h)?,
            PendingDestroy::CommandBuffer(h) => ctx.destroy_command_buffer(h)?,
            PendingDestroy::Fence(h) => ctx.destroy_fence(h)?,
        }
        Ok(())
    }
}

/// 仍可能被在途命令使用的资源，延迟到 `FRAME_COUNT` 帧之后再销毁
///
/// 每帧调用一次 `next_frame` 与 `housekeep`。
#[derive(Debug, Default)]
pub struct DelayedDestroyer {
    frames: [Vec<PendingDestroy>; FRAME_COUNT],
    frame_index: usize,
}

// 创建与销毁
impl DelayedDestroyer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 立即销毁所有排队的资源，调用前需要确保设备已经空闲
    pub fn destroy_all<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        let _span = tracy_client::span!("DelayedDestroyer::destroy_all");
        let mut result = Ok(());
        for _ in 0..FRAME_COUNT {
            self.next_frame();
            let frame_result = self.housekeep(ctx);
            if result.is_ok() {
                result = frame_result;
            }
        }
        result
    }
}

impl Drop for DelayedDestroyer {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "DelayedDestroyer must be drained before drop");
    }
}

// getters
impl DelayedDestroyer {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(Vec::is_empty)
    }
}

// tools
impl DelayedDestroyer {
    pub fn enqueue(&mut self, resource: PendingDestroy) {
        log::trace!("enqueue {:?} for delayed destruction", resource);
        self.frames[self.frame_index].push(resource);
    }

    pub fn next_frame(&mut self) {
        self.frame_index = (self.frame_index + 1) % FRAME_COUNT;
    }

    /// 销毁当前帧槽位中的资源，这些资源是 `FRAME_COUNT` 帧之前入队的
    ///
    /// 单个资源销毁失败不会中断其余资源的销毁，返回遇到的第一个错误。
    pub fn housekeep<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        let mut result = Ok(());
        for resource in std::mem::take(&mut self.frames[self.frame_index]) {
            if let Err(e) = resource.destroy(ctx) {
                log::warn!("failed to destroy {:?}: {}", resource, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
