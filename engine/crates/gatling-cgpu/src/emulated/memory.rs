use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use crate::error::{CgpuError, CgpuResult};

const HOST_MEMORY_ALIGNMENT: usize = 64;

/// 一块零初始化的主机内存，模拟一次设备内存分配
///
/// 内容只通过裸指针读写：映射出去的指针与录制的拷贝命令会同时指向这里。
pub struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl HostMemory {
    pub fn new(len: u64) -> CgpuResult<Self> {
        let len = usize::try_from(len).map_err(|_| CgpuError::UnableToAllocateMemory)?;
        let layout =
            Layout::from_size_align(len.max(1), HOST_MEMORY_ALIGNMENT).map_err(|_| CgpuError::UnableToAllocateMemory)?;
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(CgpuError::UnableToAllocateMemory)?;
        Ok(Self { ptr, layout, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        assert!(offset as usize + data.len() <= self.len, "HostMemory::write out of bounds");
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset as usize), data.len());
        }
    }

    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        assert!((offset + len) as usize <= self.len, "HostMemory::read out of bounds");
        let mut out = vec![0u8; len as usize];
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), len as usize);
        }
        out
    }

    /// src 与 dst 可以是同一块内存，范围允许重叠
    pub fn copy(src: &HostMemory, src_offset: u64, dst: &HostMemory, dst_offset: u64, len: u64) {
        assert!((src_offset + len) as usize <= src.len, "HostMemory::copy source out of bounds");
        assert!((dst_offset + len) as usize <= dst.len, "HostMemory::copy destination out of bounds");
        unsafe {
            ptr::copy(
                src.ptr.as_ptr().add(src_offset as usize),
                dst.ptr.as_ptr().add(dst_offset as usize),
                len as usize,
            );
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
