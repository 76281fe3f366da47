//! 按 handle 寻址、定长元素的 GPU 存储
//!
//! 元素 `i` 位于 `i * element_size` 处。backing buffer 只会增长：访问越界的元素时扩容到
//! `next_pow2(max(required_end, element_size * min_capacity))`，已有内容保持不变。

use bytemuck::Pod;
use gatling_cgpu::{BufferHandle, BufferUsage, CgpuContext, DeviceHandle, GpuBackend, Handle, HandleStore};

use crate::config::DataStoreConfig;
use crate::delayed_destroyer::DelayedDestroyer;
use crate::error::{GgpuError, GgpuResult};
use crate::stager::Stager;
use crate::sync_buffer::SyncBuffer;

/// 一个元素的只读视图
pub struct ElementRef<'a> {
    bytes: &'a [u8],
}

impl ElementRef<'_> {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn get<T: Pod>(&self) -> GgpuResult<T> {
        read_pod(self.bytes)
    }
}

/// 一个元素的可写视图，创建时该元素已经被标记为脏
pub struct ElementMut<'a> {
    bytes: &'a mut [u8],
}

impl ElementMut<'_> {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    pub fn get<T: Pod>(&self) -> GgpuResult<T> {
        read_pod(self.bytes)
    }

    /// 写入 T 的字节，元素中剩余的字节保持不变
    pub fn set<T: Pod>(&mut self, value: &T) -> GgpuResult<()> {
        let src = bytemuck::bytes_of(value);
        check_fits(src.len(), self.bytes.len())?;
        self.bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

fn check_fits(size: usize, element_size: usize) -> GgpuResult<()> {
    if size > element_size {
        return Err(GgpuError::ElementTypeTooLarge {
            size: size as u64,
            element_size: element_size as u64,
        });
    }
    Ok(())
}

fn read_pod<T: Pod>(bytes: &[u8]) -> GgpuResult<T> {
    let size = std::mem::size_of::<T>();
    check_fits(size, bytes.len())?;
    Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
}

/// 按下标寻址的元素数组，负责按需增长
pub(crate) struct ElementStorage {
    element_size: u64,
    min_capacity: u64,
    buffer: SyncBuffer,
}

impl ElementStorage {
    pub fn new(device: DeviceHandle, element_size: u64, config: &DataStoreConfig) -> Self {
        assert!(element_size > 0, "element size must not be zero");
        Self {
            element_size,
            min_capacity: config.min_capacity.max(1),
            buffer: SyncBuffer::new(device, BufferUsage::STORAGE, config.update_strategy),
        }
    }

    #[inline]
    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    #[inline]
    pub fn sync_buffer(&self) -> &SyncBuffer {
        &self.buffer
    }

    /// 元素 index 需要的 buffer 大小
    pub fn grown_size(&self, index: u32) -> u64 {
        let required_end = (index as u64 + 1) * self.element_size;
        required_end.max(self.element_size * self.min_capacity).next_power_of_two()
    }

    fn ensure_capacity<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        index: u32,
    ) -> GgpuResult<()> {
        let required_end = (index as u64 + 1) * self.element_size;
        if required_end <= self.buffer.size() {
            return Ok(());
        }
        let new_size = self.grown_size(index);
        log::debug!("growing element storage from {} to {} bytes", self.buffer.size(), new_size);
        self.buffer.resize(ctx, destroyer, new_size)
    }

    pub fn read<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        index: u32,
    ) -> GgpuResult<ElementRef<'_>> {
        self.ensure_capacity(ctx, destroyer, index)?;
        let bytes = self.buffer.read(index as u64 * self.element_size, self.element_size)?;
        Ok(ElementRef { bytes })
    }

    pub fn write<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        index: u32,
    ) -> GgpuResult<ElementMut<'_>> {
        self.ensure_capacity(ctx, destroyer, index)?;
        let bytes = self.buffer.write(index as u64 * self.element_size, self.element_size)?;
        Ok(ElementMut { bytes })
    }

    /// 两个元素都必须已经在 buffer 范围内
    pub fn move_element(&mut self, src: u32, dst: u32) -> GgpuResult<()> {
        self.buffer.copy_within(
            src as u64 * self.element_size,
            dst as u64 * self.element_size,
            self.element_size,
        )
    }

    /// 元素不在 buffer 范围内时什么都不做
    pub fn clear_element(&mut self, index: u32) -> GgpuResult<()> {
        let offset = index as u64 * self.element_size;
        if offset + self.element_size <= self.buffer.size() {
            self.buffer.write(offset, self.element_size)?.fill(0);
        }
        Ok(())
    }

    pub fn commit<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>, stager: &mut dyn Stager<B>) -> GgpuResult<()> {
        self.buffer.commit(ctx, stager)
    }

    pub fn destroy<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
    ) -> GgpuResult<()> {
        self.buffer.destroy(ctx, destroyer)
    }
}

pub struct LinearDataStore {
    handles: HandleStore,
    element_count: u64,
    storage: ElementStorage,
}

// 创建与销毁
impl LinearDataStore {
    pub fn new(device: DeviceHandle, element_size: u64, config: &DataStoreConfig) -> Self {
        Self {
            handles: HandleStore::new(),
            element_count: 0,
            storage: ElementStorage::new(device, element_size, config),
        }
    }

    /// backing buffer 交给 destroyer，之后 store 不能再使用
    pub fn destroy<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
    ) -> GgpuResult<()> {
        self.storage.destroy(ctx, destroyer)
    }
}

// getters
impl LinearDataStore {
    #[inline]
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.storage.sync_buffer().buffer()
    }

    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.storage.sync_buffer().size()
    }

    /// 存活元素的数量
    #[inline]
    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    #[inline]
    pub fn element_size(&self) -> u64 {
        self.storage.element_size()
    }
}

// tools
impl LinearDataStore {
    /// 只分配 handle，不触碰 GPU 内存
    pub fn allocate(&mut self) -> Handle {
        self.element_count += 1;
        self.handles.create()
    }

    /// 不会缩小 buffer
    pub fn free(&mut self, handle: Handle) -> GgpuResult<()> {
        if !self.handles.free(handle) {
            return Err(GgpuError::InvalidElementHandle(handle.raw()));
        }
        self.element_count -= 1;
        Ok(())
    }

    pub fn read<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        handle: Handle,
    ) -> GgpuResult<ElementRef<'_>> {
        let index = self.index_of(handle)?;
        self.storage.read(ctx, destroyer, index)
    }

    pub fn write<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        handle: Handle,
    ) -> GgpuResult<ElementMut<'_>> {
        let index = self.index_of(handle)?;
        self.storage.write(ctx, destroyer, index)
    }

    /// 把脏区间交给 stager，失败时脏区间保留到下一次 commit
    pub fn commit_changes<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
    ) -> GgpuResult<()> {
        self.storage.commit(ctx, stager)
    }

    fn index_of(&self, handle: Handle) -> GgpuResult<u32> {
        if !self.handles.is_valid(handle) {
            return Err(GgpuError::InvalidElementHandle(handle.raw()));
        }
        Ok(HandleStore::extract_index(handle))
    }
}
