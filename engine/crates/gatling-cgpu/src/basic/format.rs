/// 计算管线中实际用到的纹理格式子集
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    R16G16B16A16Sfloat,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32A32Sfloat,
}

impl ImageFormat {
    /// 每个 texel 的字节数
    pub const fn texel_size(self) -> u64 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::R8G8Unorm => 2,
            ImageFormat::R8G8B8A8Unorm
            | ImageFormat::R8G8B8A8Srgb
            | ImageFormat::B8G8R8A8Unorm
            | ImageFormat::R32Sfloat => 4,
            ImageFormat::R16G16B16A16Sfloat | ImageFormat::R32G32Sfloat => 8,
            ImageFormat::R32G32B32A32Sfloat => 16,
        }
    }
}
