//! 主机可写、设备可读的 buffer
//!
//! 写入只记录一个脏区间（所有写入范围的并集），`commit` 时一次性同步到设备。

use std::ops::Range;
use std::ptr::NonNull;

use gatling_cgpu::{BufferHandle, BufferUsage, CgpuContext, DeviceHandle, GpuBackend, MemoryProperties};

use crate::config::UpdateStrategy;
use crate::delayed_destroyer::DelayedDestroyer;
use crate::error::{GgpuError, GgpuResult};
use crate::resizable_buffer::ResizableBuffer;
use crate::stager::Stager;

pub struct SyncBuffer {
    strategy: UpdateStrategy,
    buffer: ResizableBuffer,
    size: u64,

    /// OptimalStaging 时的主机副本
    shadow: Vec<u8>,
    /// PersistentMapping 时 buffer 的映射地址
    mapped: Option<NonNull<u8>>,

    dirty: Option<Range<u64>>,
}

// 创建与销毁
impl SyncBuffer {
    pub fn new(device: DeviceHandle, usage: BufferUsage, strategy: UpdateStrategy) -> Self {
        let memory_properties = match strategy {
            UpdateStrategy::OptimalStaging => MemoryProperties::DEVICE_LOCAL,
            UpdateStrategy::PersistentMapping => MemoryProperties::HOST_VISIBLE,
        };
        Self {
            strategy,
            buffer: ResizableBuffer::new(device, usage, memory_properties),
            size: 0,
            shadow: Vec::new(),
            mapped: None,
            dirty: None,
        }
    }

    /// 未提交的修改会被丢弃
    pub fn destroy<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
    ) -> GgpuResult<()> {
        self.unmap(ctx)?;
        self.buffer.destroy(destroyer);
        self.shadow = Vec::new();
        self.size = 0;
        self.dirty = None;
        Ok(())
    }
}

impl Drop for SyncBuffer {
    fn drop(&mut self) {
        debug_assert!(self.mapped.is_none(), "SyncBuffer must be destroyed before drop");
    }
}

// getters
impl SyncBuffer {
    /// 设备端读取的 buffer，大小为 0 时没有 buffer
    #[inline]
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer.buffer()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn strategy(&self) -> UpdateStrategy {
        self.strategy
    }

    #[inline]
    pub fn dirty_range(&self) -> Option<Range<u64>> {
        self.dirty.clone()
    }
}

// tools
impl SyncBuffer {
    pub fn read(&self, offset: u64, len: u64) -> GgpuResult<&[u8]> {
        self.check_range(offset, len)?;
        Ok(&self.host_bytes()[offset as usize..(offset + len) as usize])
    }

    /// 返回的切片范围被并入脏区间
    pub fn write(&mut self, offset: u64, len: u64) -> GgpuResult<&mut [u8]> {
        self.check_range(offset, len)?;
        self.mark_dirty(offset..offset + len);
        Ok(&mut self.host_bytes_mut()[offset as usize..(offset + len) as usize])
    }

    /// 在 buffer 内部搬移数据，目标范围被并入脏区间
    pub fn copy_within(&mut self, src_offset: u64, dst_offset: u64, len: u64) -> GgpuResult<()> {
        self.check_range(src_offset, len)?;
        self.check_range(dst_offset, len)?;
        self.mark_dirty(dst_offset..dst_offset + len);
        self.host_bytes_mut()
            .copy_within(src_offset as usize..(src_offset + len) as usize, dst_offset as usize);
        Ok(())
    }

    /// 保留前 `min(old, new)` 字节的内容
    ///
    /// OptimalStaging 时保留的范围重新标记为脏，下次 commit 会把主机副本完整地同步到新 buffer。
    pub fn resize<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        new_size: u64,
    ) -> GgpuResult<()> {
        if new_size == self.size {
            return Ok(());
        }
        let _span = tracy_client::span!("SyncBuffer::resize");
        let kept = self.size.min(new_size);

        match self.strategy {
            UpdateStrategy::OptimalStaging => {
                self.buffer.resize(ctx, destroyer, new_size)?;
                self.shadow.resize(new_size as usize, 0);
                self.dirty = (kept > 0).then_some(0..kept);
            }
            UpdateStrategy::PersistentMapping => {
                // 旧内容由 GPU 拷贝，先让主机写入对设备可见
                self.flush_dirty(ctx)?;
                self.unmap(ctx)?;
                let result = self.buffer.resize(ctx, destroyer, new_size);
                if let Some(buffer) = self.buffer.buffer() {
                    self.mapped = Some(ctx.map_buffer(buffer)?);
                }
                result?;
                if new_size > self.size {
                    // 新增部分的内容不确定，清零
                    if let Some(mapped) = self.mapped {
                        unsafe {
                            std::ptr::write_bytes(
                                mapped.as_ptr().add(self.size as usize),
                                0,
                                (new_size - self.size) as usize,
                            );
                        }
                        self.dirty = Some(self.size..new_size);
                    }
                }
            }
        }

        self.size = new_size;
        Ok(())
    }

    /// 把脏区间同步到设备，失败时脏区间保持不变
    ///
    /// OptimalStaging 只负责把数据交给 stager，调用方需要在读取之前 flush stager。
    pub fn commit<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
    ) -> GgpuResult<()> {
        let Some(range) = self.dirty.clone() else {
            return Ok(());
        };
        let _span = tracy_client::span!("SyncBuffer::commit");

        match self.strategy {
            UpdateStrategy::OptimalStaging => {
                let Some(buffer) = self.buffer.buffer() else {
                    self.dirty = None;
                    return Ok(());
                };
                // 起止都按 4 字节对齐
                let begin = range.start / 4 * 4;
                let end = range.end.div_ceil(4).saturating_mul(4).min(self.size);
                stager.stage_to_buffer(ctx, &self.shadow[begin as usize..end as usize], buffer, begin)?;
                log::trace!("committed bytes [{}, {})", begin, end);
                self.dirty = None;
            }
            UpdateStrategy::PersistentMapping => self.flush_dirty(ctx)?,
        }
        Ok(())
    }

    fn flush_dirty<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if let (Some(range), Some(buffer)) = (self.dirty.clone(), self.buffer.buffer()) {
            ctx.flush_mapped_memory(buffer, range.start, range.end - range.start)?;
        }
        self.dirty = None;
        Ok(())
    }

    fn unmap<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>) -> GgpuResult<()> {
        if let (Some(_), Some(buffer)) = (self.mapped.take(), self.buffer.buffer()) {
            ctx.unmap_buffer(buffer)?;
        }
        Ok(())
    }

    fn host_bytes(&self) -> &[u8] {
        match (self.strategy, self.mapped) {
            (UpdateStrategy::PersistentMapping, Some(mapped)) => unsafe {
                std::slice::from_raw_parts(mapped.as_ptr(), self.size as usize)
            },
            (UpdateStrategy::PersistentMapping, None) => &[],
            (UpdateStrategy::OptimalStaging, _) => &self.shadow,
        }
    }

    fn host_bytes_mut(&mut self) -> &mut [u8] {
        match (self.strategy, self.mapped) {
            (UpdateStrategy::PersistentMapping, Some(mapped)) => unsafe {
                std::slice::from_raw_parts_mut(mapped.as_ptr(), self.size as usize)
            },
            (UpdateStrategy::PersistentMapping, None) => &mut [],
            (UpdateStrategy::OptimalStaging, _) => &mut self.shadow,
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> GgpuResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(GgpuError::RangeOutOfBounds {
                offset,
                size: len,
                capacity: self.size,
            });
        }
        Ok(())
    }

    fn mark_dirty(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        self.dirty = Some(match self.dirty.take() {
            Some(dirty) => dirty.start.min(range.start)..dirty.end.max(range.end),
            None => range,
        });
    }
}
