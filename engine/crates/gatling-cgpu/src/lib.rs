//! Gatling 的 GPU 抽象层
//!
//! - `handle`：代际校验的 64 位 handle 与按资源类型实例化的对象表
//! - `context`：扁平的 create/destroy/map/copy/dispatch/submit API，所有状态都在显式的 `CgpuContext` 中
//! - `backend`：后端接缝；`vulkan` 为生产后端，`emulated` 在主机内存上执行命令，供测试使用

pub mod backend;
pub mod basic;
pub mod context;
pub mod emulated;
pub mod error;
pub mod foundation;
pub mod handle;
pub mod vulkan;

pub use backend::GpuBackend;
pub use basic::desc::*;
pub use basic::flags::*;
pub use basic::format::ImageFormat;
pub use basic::limits::DeviceLimits;
pub use context::{AppInfo, CgpuConfig, CgpuContext, MAX_TIMESTAMP_QUERIES};
pub use error::{CgpuError, CgpuResult};
pub use handle::handle_store::{Handle, HandleStore};
pub use handle::object_table::{ObjectTable, ResolveMode};
pub use handle::typed::*;
pub use emulated::{EmulatedBackend, EmulatedConfig, EmulatedStats};
pub use vulkan::VulkanBackend;
