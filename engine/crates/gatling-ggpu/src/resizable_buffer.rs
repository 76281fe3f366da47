use gatling_cgpu::{
    BufferDesc, BufferHandle, BufferUsage, CgpuContext, CommandBufferHandle, DeviceHandle, FenceHandle, GpuBackend,
    MemoryProperties,
};

use crate::delayed_destroyer::{DelayedDestroyer, PendingDestroy};
use crate::error::GgpuResult;

/// 通过重新创建来改变大小的 buffer
///
/// 改变大小时把旧内容中的前 `min(old, new)` 字节拷进新 buffer，旧 buffer 交给 `DelayedDestroyer`。
pub struct ResizableBuffer {
    device: DeviceHandle,
    buffer: Option<BufferHandle>,
    size: u64,
    usage: BufferUsage,
    memory_properties: MemoryProperties,
}

// 创建与销毁
impl ResizableBuffer {
    /// 创建时不分配任何 buffer
    pub fn new(device: DeviceHandle, usage: BufferUsage, memory_properties: MemoryProperties) -> Self {
        Self {
            device,
            buffer: None,
            size: 0,
            usage: usage | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            memory_properties,
        }
    }

    pub fn destroy(&mut self, destroyer: &mut DelayedDestroyer) {
        if let Some(buffer) = self.buffer.take() {
            destroyer.enqueue(PendingDestroy::Buffer(buffer));
        }
        self.size = 0;
    }
}

impl Drop for ResizableBuffer {
    fn drop(&mut self) {
        debug_assert!(self.buffer.is_none(), "ResizableBuffer must be destroyed before drop");
    }
}

// getters
impl ResizableBuffer {
    #[inline]
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties
    }
}

// tools
impl ResizableBuffer {
    /// 失败时保持原来的 buffer 与大小不变
    pub fn resize<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        new_size: u64,
    ) -> GgpuResult<()> {
        if new_size == self.size {
            return Ok(());
        }
        let _span = tracy_client::span!("ResizableBuffer::resize");

        if new_size == 0 {
            self.destroy(destroyer);
            return Ok(());
        }

        let desc = BufferDesc {
            size: new_size,
            usage: self.usage,
            memory_properties: self.memory_properties,
        };
        let new_buffer = ctx.create_buffer(self.device, &desc)?;

        if let Some(old_buffer) = self.buffer {
            let copy_size = self.size.min(new_size);
            if let Err(e) = copy_once(ctx, self.device, old_buffer, new_buffer, copy_size) {
                log::error!("failed to copy buffer contents during resize: {}", e);
                if let Err(e) = ctx.destroy_buffer(new_buffer) {
                    log::warn!("failed to destroy buffer: {}", e);
                }
                return Err(e);
            }
            destroyer.enqueue(PendingDestroy::Buffer(old_buffer));
        }

        log::trace!("resized buffer from {} to {} bytes", self.size, new_size);
        self.buffer = Some(new_buffer);
        self.size = new_size;
        Ok(())
    }
}

/// 用一次性的 command buffer 拷贝并同步等待完成
fn copy_once<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    src: BufferHandle,
    dst: BufferHandle,
    size: u64,
) -> GgpuResult<()> {
    let command_buffer = ctx.create_command_buffer(device)?;
    let fence = match ctx.create_fence(device) {
        Ok(fence) => fence,
        Err(e) => {
            release_one_shot(ctx, command_buffer, None);
            return Err(e.into());
        }
    };

    let result = (|| -> GgpuResult<()> {
        ctx.begin_command_buffer(command_buffer)?;
        ctx.cmd_copy_buffer(command_buffer, src, 0, dst, 0, size)?;
        ctx.end_command_buffer(command_buffer)?;
        ctx.reset_fence(fence)?;
        ctx.submit_command_buffer(command_buffer, fence)?;
        ctx.wait_for_fence(fence)?;
        Ok(())
    })();

    release_one_shot(ctx, command_buffer, Some(fence));
    result
}

fn release_one_shot<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    command_buffer: CommandBufferHandle,
    fence: Option<FenceHandle>,
) {
    if let Some(fence) = fence {
        if let Err(e) = ctx.destroy_fence(fence) {
            log::warn!("failed to destroy fence: {}", e);
        }
    }
    if let Err(e) = ctx.destroy_command_buffer(command_buffer) {
        log::warn!("failed to destroy command buffer: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestGpu, pattern};

    fn host_buffer(gpu: &TestGpu) -> ResizableBuffer {
        ResizableBuffer::new(
            gpu.device,
            BufferUsage::STORAGE,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
        )
    }

    fn fill(gpu: &mut TestGpu, buffer: BufferHandle, data: &[u8]) {
        let ptr = gpu.ctx.map_buffer(buffer).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        gpu.ctx.unmap_buffer(buffer).unwrap();
    }

    #[test]
    fn test_grow_keeps_contents() {
        let mut gpu = TestGpu::new();
        let mut destroyer = DelayedDestroyer::new();
        let mut buffer = host_buffer(&gpu);

        buffer.resize(&mut gpu.ctx, &mut destroyer, 64).unwrap();
        let data = pattern(b"GATLING", 64);
        fill(&mut gpu, buffer.buffer().unwrap(), &data);

        buffer.resize(&mut gpu.ctx, &mut destroyer, 256).unwrap();
        assert_eq!(buffer.size(), 256);
        assert_eq!(&gpu.contents(buffer.buffer().unwrap())[..64], &data[..]);
        assert_eq!(destroyer.pending_count(), 1);

        buffer.destroy(&mut destroyer);
        destroyer.destroy_all(&mut gpu.ctx).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_shrink_copies_prefix() {
        let mut gpu = TestGpu::new();
        let mut destroyer = DelayedDestroyer::new();
        let mut buffer = host_buffer(&gpu);

        buffer.resize(&mut gpu.ctx, &mut destroyer, 128).unwrap();
        let data = pattern(b"GATLING", 128);
        fill(&mut gpu, buffer.buffer().unwrap(), &data);

        buffer.resize(&mut gpu.ctx, &mut destroyer, 32).unwrap();
        assert_eq!(gpu.contents(buffer.buffer().unwrap()), &data[..32]);

        buffer.resize(&mut gpu.ctx, &mut destroyer, 0).unwrap();
        assert!(buffer.buffer().is_none());
        assert_eq!(destroyer.pending_count(), 2);

        destroyer.destroy_all(&mut gpu.ctx).unwrap();
        gpu.shutdown();
    }
}
