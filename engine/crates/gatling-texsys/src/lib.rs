//! 纹理资源的加载与缓存

pub mod asset_reader;
pub mod texsys;

pub use asset_reader::{AssetReader, FsAssetReader};
pub use texsys::{TexSys, TextureResource, TextureSource};
