//! 构建在 cgpu 之上的数据传输与存储
//!
//! - `stager`：把主机数据批量上传到 buffer 与 image
//! - `sync_buffer` / `resizable_buffer`：主机可写、按需改变大小的设备 buffer
//! - `linear_data_store` / `dense_data_store`：按 handle 寻址的定长元素存储
//! - `delayed_destroyer`：延迟若干帧销毁仍可能被 GPU 使用的资源

pub mod bump_allocator;
pub mod config;
pub mod delayed_destroyer;
pub mod dense_data_store;
pub mod error;
pub mod linear_data_store;
pub mod resizable_buffer;
pub mod stager;
pub mod sync_buffer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bump_allocator::BumpAllocator;
pub use config::{DataStoreConfig, StagerConfig, StagerKind, UpdateStrategy};
pub use delayed_destroyer::{DelayedDestroyer, PendingDestroy};
pub use dense_data_store::DenseDataStore;
pub use error::{GgpuError, GgpuResult};
pub use linear_data_store::{ElementMut, ElementRef, LinearDataStore};
pub use resizable_buffer::ResizableBuffer;
pub use stager::{DoubleBufferedStager, Stager, SyncStager, create_stager};
pub use sync_buffer::SyncBuffer;
