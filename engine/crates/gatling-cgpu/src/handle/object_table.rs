use serde::Deserialize;

use crate::error::{CgpuError, CgpuResult};
use crate::handle::handle_store::{Handle, HandleStore};

/// handle 解析模式
///
/// - `Strict`：每次解析都校验 generation，陈旧的 handle 返回 `InvalidHandle`
/// - `Unchecked`：只按 index 取 slot，不校验 generation；陈旧 handle 可能解析到复用该 index 的新对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveMode {
    #[default]
    Strict,
    Unchecked,
}

/// 某一类资源的对象表
///
/// slot 存储在 handle 分配时按 index 增长，因此每个分配出的 handle 都有对应的 slot。
/// 表独占后端资源，调用方只持有 handle。
pub struct ObjectTable<T> {
    store: HandleStore,
    slots: Vec<Option<T>>,
    mode: ResolveMode,
}

impl<T> ObjectTable<T> {
    pub fn new(mode: ResolveMode) -> Self {
        Self {
            store: HandleStore::new(),
            slots: Vec::new(),
            mode,
        }
    }

    /// 先分配 handle，再创建后端资源；创建失败时释放 handle，保证 handle 空间与实际资源一致
    pub fn insert_with<E>(&mut self, create: impl FnOnce(Handle) -> Result<T, E>) -> Result<Handle, E> {
        let handle = self.store.create();
        let index = handle.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }

        match create(handle) {
            Ok(object) => {
                self.slots[index] = Some(object);
                Ok(handle)
            }
            Err(e) => {
                self.store.free(handle);
                Err(e)
            }
        }
    }

    pub fn resolve(&self, handle: Handle) -> CgpuResult<&T> {
        if self.mode == ResolveMode::Strict && !self.store.is_valid(handle) {
            return Err(CgpuError::InvalidHandle);
        }
        self.slots.get(handle.index() as usize).and_then(Option::as_ref).ok_or(CgpuError::InvalidHandle)
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> CgpuResult<&mut T> {
        if self.mode == ResolveMode::Strict && !self.store.is_valid(handle) {
            return Err(CgpuError::InvalidHandle);
        }
        self.slots.get_mut(handle.index() as usize).and_then(Option::as_mut).ok_or(CgpuError::InvalidHandle)
    }

    /// 移除对象并使 handle 失效
    ///
    /// 无论解析模式如何，移除总是校验 generation，重复销毁会返回 `InvalidHandle`
    pub fn remove(&mut self, handle: Handle) -> CgpuResult<T> {
        if !self.store.is_valid(handle) {
            return Err(CgpuError::InvalidHandle);
        }
        let object = self.slots[handle.index() as usize].take().ok_or(CgpuError::InvalidHandle)?;
        self.store.free(handle);
        Ok(object)
    }

    #[inline]
    pub fn is_valid(&self, handle: Handle) -> bool {
        self.store.is_valid(handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.store.live_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn mode(&self) -> ResolveMode {
        self.mode
    }

    /// 遍历所有存活对象，存活的 slot 一定处于当前 generation
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|object| (Handle::encode(self.store.generation_of(index as u32), index as u32), object))
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let mut table = ObjectTable::new(ResolveMode::Strict);
        let h = table.insert_with(|_| Ok::<_, CgpuError>(42u32)).unwrap();
        assert_eq!(*table.resolve(h).unwrap(), 42);

        *table.resolve_mut(h).unwrap() = 7;
        assert_eq!(*table.resolve(h).unwrap(), 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_failed_creation_frees_handle() {
        let mut table = ObjectTable::<u32>::new(ResolveMode::Strict);
        let err = table.insert_with(|_| Err(CgpuError::UnableToCreateBuffer)).unwrap_err();
        assert_eq!(err, CgpuError::UnableToCreateBuffer);
        assert!(table.is_empty());

        // 失败时释放的 index 被复用，但 generation 已经前进
        let h = table.insert_with(|_| Ok::<_, CgpuError>(1)).unwrap();
        assert_eq!(h.index(), 0);
        assert_eq!(h.generation(), 2);
    }

    #[test]
    fn test_strict_mode_rejects_stale_handle() {
        let mut table = ObjectTable::new(ResolveMode::Strict);
        let old = table.insert_with(|_| Ok::<_, CgpuError>("old")).unwrap();
        table.remove(old).unwrap();
        let new = table.insert_with(|_| Ok::<_, CgpuError>("new")).unwrap();

        assert_eq!(old.index(), new.index());
        assert_eq!(table.resolve(old), Err(CgpuError::InvalidHandle));
        assert_eq!(*table.resolve(new).unwrap(), "new");
    }

    #[test]
    fn test_unchecked_mode_skips_generation_check() {
        let mut table = ObjectTable::new(ResolveMode::Unchecked);
        let old = table.insert_with(|_| Ok::<_, CgpuError>("old")).unwrap();
        table.remove(old).unwrap();

        // slot 为空时仍然报错
        assert_eq!(table.resolve(old), Err(CgpuError::InvalidHandle));

        // index 被复用后，陈旧 handle 解析到了新对象
        table.insert_with(|_| Ok::<_, CgpuError>("new")).unwrap();
        assert_eq!(*table.resolve(old).unwrap(), "new");
    }

    #[test]
    fn test_double_remove_is_rejected() {
        let mut table = ObjectTable::new(ResolveMode::Unchecked);
        let h = table.insert_with(|_| Ok::<_, CgpuError>(1u8)).unwrap();
        assert!(table.remove(h).is_ok());
        assert_eq!(table.remove(h), Err(CgpuError::InvalidHandle));
    }

    #[test]
    fn test_handles_lists_live_objects() {
        let mut table = ObjectTable::new(ResolveMode::Strict);
        let a = table.insert_with(|_| Ok::<_, CgpuError>(1)).unwrap();
        let b = table.insert_with(|_| Ok::<_, CgpuError>(2)).unwrap();
        table.remove(a).unwrap();
        assert_eq!(table.handles(), vec![b]);
    }
}
