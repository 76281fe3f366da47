use bitflags::bitflags;

/// 表示“从 offset 到 buffer 末尾”的 size
pub const WHOLE_SIZE: u64 = !0u64;

bitflags! {
    /// 内存类型需要满足的属性，分配时做 first-fit 扫描
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const HOST_VISIBLE = 0x0000_0002;
        const HOST_COHERENT = 0x0000_0004;
        const HOST_CACHED = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
        const PROTECTED = 0x0000_0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM = 0x0000_0004;
        const STORAGE = 0x0000_0008;
        const UNIFORM_TEXEL = 0x0000_0010;
        const STORAGE_TEXEL = 0x0000_0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const SAMPLED = 0x0000_0004;
        const STORAGE = 0x0000_0008;
    }
}

bitflags! {
    /// 屏障两侧的访问类型，后端统一映射到 compute shader + transfer 阶段
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const UNIFORM_READ = 0x0000_0001;
        const SHADER_READ = 0x0000_0002;
        const SHADER_WRITE = 0x0000_0004;
        const TRANSFER_READ = 0x0000_0008;
        const TRANSFER_WRITE = 0x0000_0010;
        const HOST_READ = 0x0000_0020;
        const HOST_WRITE = 0x0000_0040;
        const MEMORY_READ = 0x0000_0080;
        const MEMORY_WRITE = 0x0000_0100;
    }
}

bitflags! {
    /// shader 对某个绑定资源的访问方式
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceAccess: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
    }
}
