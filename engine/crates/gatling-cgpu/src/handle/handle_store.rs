//! 代际计数的 index 分配器
//!
//! handle 的低 32 位是 slot index，高 32 位是 generation。generation 在 free 时递增，
//! 因此已释放 handle 的所有拷贝都会立即失效，而 index 本身可以被复用。

use std::fmt;

/// 不透明的 64 位 handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    /// generation 从 1 开始，所以编码值 0 永远不会被分配出去
    pub const NULL: Handle = Handle(0);

    #[inline]
    pub const fn encode(generation: u32, index: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// 纯解码，不做任何校验
    #[inline]
    pub const fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index(), self.generation())
    }
}

/// 单线程使用，不做任何同步
#[derive(Debug, Default)]
pub struct HandleStore {
    next_index: u32,
    /// generation 为 0 的 index 已经退役
    generations: Vec<u32>,
    free_indices: Vec<u32>,
    retired_count: u32,
}

impl HandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 优先复用 free list 中的 index，其 generation 已经在 free 时递增过
    pub fn create(&mut self) -> Handle {
        if let Some(index) = self.free_indices.pop() {
            return Handle::encode(self.generations[index as usize], index);
        }

        let index = self.next_index;
        assert!(index != u32::MAX, "HandleStore: index space exhausted");
        self.next_index += 1;
        self.generations.push(1);

        Handle::encode(1, index)
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        let index = handle.index();
        let generation = handle.generation();
        generation != 0 && index < self.next_index && self.generations[index as usize] == generation
    }

    /// 释放 handle，返回 false 表示 handle 已经失效（重复释放或陈旧的 handle），此时不做任何修改
    pub fn free(&mut self, handle: Handle) -> bool {
        if !self.is_valid(handle) {
            log::warn!("HandleStore: ignoring free of stale handle {:?}", handle);
            return false;
        }

        let index = handle.index();
        let generation = &mut self.generations[index as usize];
        if *generation == u32::MAX {
            // generation 用尽，index 不再复用，避免同一个 handle 值再次出现
            log::debug!("HandleStore: retiring index {}", index);
            *generation = 0;
            self.retired_count += 1;
        } else {
            *generation += 1;
            self.free_indices.push(index);
        }
        true
    }

    /// index 当前的 generation，index 从未分配过或已经退役时返回 0
    #[inline]
    pub fn generation_of(&self, index: u32) -> u32 {
        self.generations.get(index as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub fn extract_index(handle: Handle) -> u32 {
        handle.index()
    }

    /// 当前存活的 handle 数量
    #[inline]
    pub fn live_count(&self) -> usize {
        self.next_index as usize - self.free_indices.len() - self.retired_count as usize
    }

    /// 曾经分配过的 index 上界（不含）
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.next_index
    }
}
