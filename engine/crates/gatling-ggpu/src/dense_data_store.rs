use std::collections::HashMap;

use gatling_cgpu::{BufferHandle, CgpuContext, DeviceHandle, GpuBackend, Handle, HandleStore};

use crate::config::DataStoreConfig;
use crate::delayed_destroyer::DelayedDestroyer;
use crate::error::{GgpuError, GgpuResult};
use crate::linear_data_store::{ElementMut, ElementRef, ElementStorage};
use crate::stager::Stager;

/// 存活元素始终紧密排列在 `[0, element_count)` 中
///
/// free 时把最后一个元素搬到被释放的位置，shader 可以直接按 `element_count` 遍历。
/// 元素的位置会随 free 改变，只有 handle 是稳定的。
pub struct DenseDataStore {
    handles: HandleStore,
    sparse_to_dense: HashMap<Handle, u32>,
    /// dense 下标到 handle 的反向映射
    dense_handles: Vec<Handle>,
    storage: ElementStorage,
}

// 创建与销毁
impl DenseDataStore {
    pub fn new(device: DeviceHandle, element_size: u64, config: &DataStoreConfig) -> Self {
        Self {
            handles: HandleStore::new(),
            sparse_to_dense: HashMap::with_capacity(config.min_capacity as usize),
            dense_handles: Vec::with_capacity(config.min_capacity as usize),
            storage: ElementStorage::new(device, element_size, config),
        }
    }

    pub fn destroy<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
    ) -> GgpuResult<()> {
        self.sparse_to_dense.clear();
        self.dense_handles.clear();
        self.storage.destroy(ctx, destroyer)
    }
}

// getters
impl DenseDataStore {
    #[inline]
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.storage.sync_buffer().buffer()
    }

    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.storage.sync_buffer().size()
    }

    #[inline]
    pub fn element_count(&self) -> u64 {
        self.dense_handles.len() as u64
    }

    /// handle 当前所在的 dense 下标
    #[inline]
    pub fn dense_index(&self, handle: Handle) -> Option<u32> {
        self.sparse_to_dense.get(&handle).copied()
    }
}

// tools
impl DenseDataStore {
    pub fn allocate(&mut self) -> Handle {
        let handle = self.handles.create();
        let dense = self.dense_handles.len() as u32;
        self.dense_handles.push(handle);
        self.sparse_to_dense.insert(handle, dense);
        handle
    }

    pub fn free(&mut self, handle: Handle) -> GgpuResult<()> {
        let Some(dense) = self.sparse_to_dense.remove(&handle) else {
            return Err(GgpuError::InvalidElementHandle(handle.raw()));
        };

        let last = self.dense_handles.len() as u32 - 1;
        if dense != last {
            // 最后一个元素可能从未被访问过，此时 buffer 中没有它的数据，只需清掉被释放元素留下的内容
            let element_size = self.storage.element_size();
            if (last as u64 + 1) * element_size <= self.storage.sync_buffer().size() {
                self.storage.move_element(last, dense)?;
            } else {
                self.storage.clear_element(dense)?;
            }
            let moved = self.dense_handles[last as usize];
            self.sparse_to_dense.insert(moved, dense);
        }
        self.dense_handles.swap_remove(dense as usize);
        self.handles.free(handle);
        Ok(())
    }

    pub fn read<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        handle: Handle,
    ) -> GgpuResult<ElementRef<'_>> {
        let dense = self.dense_of(handle)?;
        self.storage.read(ctx, destroyer, dense)
    }

    pub fn write<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        destroyer: &mut DelayedDestroyer,
        handle: Handle,
    ) -> GgpuResult<ElementMut<'_>> {
        let dense = self.dense_of(handle)?;
        self.storage.write(ctx, destroyer, dense)
    }

    pub fn commit_changes<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
    ) -> GgpuResult<()> {
        self.storage.commit(ctx, stager)
    }

    fn dense_of(&self, handle: Handle) -> GgpuResult<u32> {
        self.dense_index(handle)
            .ok_or(GgpuError::InvalidElementHandle(handle.raw()))
    }
}
