use std::ptr::NonNull;

use gatling_cgpu::{
    BufferDesc, BufferHandle, BufferUsage, CgpuContext, DeviceHandle, GpuBackend, MemoryProperties,
};

use crate::delayed_destroyer::{DelayedDestroyer, PendingDestroy};
use crate::error::{GgpuError, GgpuResult};

/// 每帧的临时 uniform 数据，从一块持久映射的 buffer 中环形分配
///
/// 分配不会被单独释放；尾部放不下时回到 0 重新开始，调用方需要保证回绕前的数据已经不再被 GPU 使用。
pub struct BumpAllocator {
    buffer: BufferHandle,
    mapped: NonNull<u8>,
    size: u64,
    alignment: u64,
    offset: u64,

    destroyed: bool,
}

// 创建与销毁
impl BumpAllocator {
    pub fn new<B: GpuBackend>(ctx: &mut CgpuContext<B>, device: DeviceHandle, size: u64) -> GgpuResult<Self> {
        let _span = tracy_client::span!("BumpAllocator::new");
        let limits = ctx.device_limits(device)?;

        let mut desc = BufferDesc {
            size,
            usage: BufferUsage::UNIFORM,
            memory_properties: MemoryProperties::DEVICE_LOCAL
                | MemoryProperties::HOST_VISIBLE
                | MemoryProperties::HOST_COHERENT,
        };
        let buffer = match ctx.create_buffer(device, &desc) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::debug!("device local uniform memory unavailable ({}), falling back to host memory", e);
                desc.memory_properties = MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT;
                ctx.create_buffer(device, &desc)?
            }
        };

        let mapped = match ctx.map_buffer(buffer) {
            Ok(mapped) => mapped,
            Err(e) => {
                if let Err(e) = ctx.destroy_buffer(buffer) {
                    log::warn!("failed to destroy bump allocator buffer: {}", e);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            buffer,
            mapped,
            size,
            alignment: limits.min_uniform_buffer_offset_alignment.max(1),
            offset: 0,
            destroyed: false,
        })
    }

    /// buffer 交给 destroyer，已经录制的命令仍然可以安全地读取它
    pub fn destroy<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
    ) -> GgpuResult<()> {
        ctx.unmap_buffer(self.buffer)?;
        destroyer.enqueue(PendingDestroy::Buffer(self.buffer));
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for BumpAllocator {
    fn drop(&mut self) {
        debug_assert!(self.destroyed, "BumpAllocator must be destroyed before drop");
    }
}

// getters
impl BumpAllocator {
    #[inline]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

// tools
impl BumpAllocator {
    /// 返回分配在 buffer 中的偏移以及对应的可写内存
    pub fn alloc(&mut self, size: u64) -> GgpuResult<(u64, &mut [u8])> {
        if size > self.size {
            return Err(GgpuError::AllocationTooLarge {
                size,
                capacity: self.size,
            });
        }

        let mut offset = self.offset.div_ceil(self.alignment) * self.alignment;
        if offset + size > self.size {
            offset = 0;
        }
        self.offset = offset + size;

        let bytes = unsafe { std::slice::from_raw_parts_mut(self.mapped.as_ptr().add(offset as usize), size as usize) };
        Ok((offset, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestGpu;

    #[test]
    fn test_alloc_aligns_and_wraps() {
        let mut gpu = TestGpu::new();
        let mut destroyer = DelayedDestroyer::new();
        let mut allocator = BumpAllocator::new(&mut gpu.ctx, gpu.device, 256).unwrap();
        assert_eq!(allocator.alignment(), 64);

        let (offset, bytes) = allocator.alloc(10).unwrap();
        assert_eq!(offset, 0);
        bytes.copy_from_slice(b"GATLING!!!");
        assert_eq!(allocator.alloc(100).unwrap().0, 64);
        // 192 + 100 放不下，回到 0
        assert_eq!(allocator.alloc(100).unwrap().0, 0);
        assert_eq!(allocator.alloc(256).unwrap().0, 0);
        assert_eq!(
            allocator.alloc(257).unwrap_err(),
            GgpuError::AllocationTooLarge {
                size: 257,
                capacity: 256
            }
        );

        allocator.destroy(&mut gpu.ctx, &mut destroyer).unwrap();
        destroyer.destroy_all(&mut gpu.ctx).unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_host_memory_fallback() {
        let mut gpu = TestGpu::without_rebar();
        let mut destroyer = DelayedDestroyer::new();
        let mut allocator = BumpAllocator::new(&mut gpu.ctx, gpu.device, 128).unwrap();

        let (offset, bytes) = allocator.alloc(4).unwrap();
        bytes.copy_from_slice(&[1, 2, 3, 4]);
        let properties = gpu.ctx.buffer_native(allocator.buffer()).unwrap().memory_properties();
        assert!(!properties.contains(MemoryProperties::DEVICE_LOCAL));
        assert_eq!(&gpu.contents(allocator.buffer())[offset as usize..4], &[1u8, 2, 3, 4]);

        allocator.destroy(&mut gpu.ctx, &mut destroyer).unwrap();
        destroyer.destroy_all(&mut gpu.ctx).unwrap();
        gpu.shutdown();
    }
}
