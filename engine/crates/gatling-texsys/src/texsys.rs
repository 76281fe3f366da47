use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use gatling_cgpu::{CgpuContext, DeviceHandle, GpuBackend, ImageDesc, ImageFormat, ImageHandle, ImageUsage, MemoryProperties};
use gatling_ggpu::{DelayedDestroyer, PendingDestroy, Stager};

use crate::asset_reader::AssetReader;

const BYTES_TO_MIB: f64 = 1.0 / (1024.0 * 1024.0);

/// 纹理数据的来源
#[derive(Debug, Clone)]
pub enum TextureSource {
    /// 从 AssetReader 读取并解码，结果按路径缓存
    Path(PathBuf),
    /// 已经解码好的 RGBA8 texel，不缓存
    Payload {
        width: u32,
        height: u32,
        depth: u32,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct TextureResource {
    pub source: TextureSource,
    pub is_3d: bool,
}

/// 按路径缓存的纹理系统
///
/// 缓存只增不减，直到显式地 evict 或者 destroy。
pub struct TexSys {
    device: DeviceHandle,
    asset_reader: Box<dyn AssetReader>,
    image_cache: HashMap<PathBuf, ImageHandle>,
    /// 上传失败的 image 可能仍被 stager 中未提交的拷贝引用
    destroyer: DelayedDestroyer,
}

// 创建与销毁
impl TexSys {
    pub fn new(device: DeviceHandle, asset_reader: Box<dyn AssetReader>) -> Self {
        Self {
            device,
            asset_reader,
            image_cache: HashMap::new(),
            destroyer: DelayedDestroyer::new(),
        }
    }

    /// 销毁所有缓存的 image 以及上传失败的 image，调用前 stager 需要已经 flush 并且空闲
    pub fn destroy<B: GpuBackend>(&mut self, ctx: &mut CgpuContext<B>) -> anyhow::Result<()> {
        let mut result = self.destroyer.destroy_all(ctx).context("failed to destroy failed uploads");
        for (path, image) in self.image_cache.drain() {
            if let Err(e) = ctx.destroy_image(image) {
                log::warn!("failed to destroy cached image {}: {}", path.display(), e);
                if result.is_ok() {
                    result = Err(e).context("failed to destroy cached image");
                }
            }
        }
        result
    }
}

impl Drop for TexSys {
    fn drop(&mut self) {
        debug_assert!(self.image_cache.is_empty(), "TexSys must be destroyed before drop");
    }
}

// getters
impl TexSys {
    #[inline]
    pub fn cached_image_count(&self) -> usize {
        self.image_cache.len()
    }

    #[inline]
    pub fn cached_image(&self, path: &Path) -> Option<ImageHandle> {
        self.image_cache.get(path).copied()
    }

    /// 上传失败、等待销毁的 image 数量
    #[inline]
    pub fn pending_destroy_count(&self) -> usize {
        self.destroyer.pending_count()
    }

    fn is_cached(&self, image: ImageHandle) -> bool {
        self.image_cache.values().any(|cached| *cached == image)
    }
}

// tools
impl TexSys {
    /// 命中缓存时直接返回缓存的 image，否则解码为 RGBA8 并上传
    pub fn load_texture_from_file_path<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
        path: &Path,
        is_3d: bool,
        flush_immediately: bool,
    ) -> anyhow::Result<ImageHandle> {
        if let Some(image) = self.image_cache.get(path) {
            return Ok(*image);
        }
        let _span = tracy_client::span!("TexSys::load_texture_from_file_path");

        let bytes = self.asset_reader.read(path)?;
        let texels = image::load_from_memory(&bytes)
            .with_context(|| format!("failed to decode image {}", path.display()))?
            .to_rgba8();
        let (width, height) = texels.dimensions();
        log::info!(
            "image read from path {} of size {:.2}MiB",
            path.display(),
            texels.as_raw().len() as f64 * BYTES_TO_MIB
        );

        let image = self.create_and_stage(ctx, stager, texels.as_raw(), width, height, 1, is_3d)?;
        self.image_cache.insert(path.to_path_buf(), image);

        if flush_immediately {
            stager.flush(ctx)?;
        }
        Ok(image)
    }

    /// 按 2D、3D 分别返回创建的 image，顺序与 resources 一致
    ///
    /// payload 为空的资源被跳过；路径无法读取或解码时使用 1x1 的黑色 image 代替。最后 flush 一次 stager。
    pub fn load_texture_resources<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
        resources: &[TextureResource],
    ) -> anyhow::Result<(Vec<ImageHandle>, Vec<ImageHandle>)> {
        let mut images_2d = Vec::with_capacity(resources.len());
        let mut images_3d = Vec::with_capacity(resources.len());
        if resources.is_empty() {
            return Ok((images_2d, images_3d));
        }
        let _span = tracy_client::span!("TexSys::load_texture_resources");
        log::info!("staging {} images", resources.len());

        for (i, resource) in resources.iter().enumerate() {
            let image = match &resource.source {
                TextureSource::Payload {
                    width,
                    height,
                    depth,
                    data,
                } => {
                    if data.is_empty() {
                        log::error!("image {} has no payload", i);
                        continue;
                    }
                    log::info!("image {} has binary payload of {:.2}MiB", i, data.len() as f64 * BYTES_TO_MIB);
                    self.create_and_stage(ctx, stager, data, *width, *height, *depth, resource.is_3d)?
                }
                TextureSource::Path(path) => {
                    match self.load_texture_from_file_path(ctx, stager, path, resource.is_3d, false) {
                        Ok(image) => image,
                        Err(e) => {
                            log::error!("failed to read image {} from path {}: {:#}", i, path.display(), e);
                            self.create_and_stage(ctx, stager, &[0; 4], 1, 1, 1, resource.is_3d)?
                        }
                    }
                }
            };

            if resource.is_3d {
                images_3d.push(image);
            } else {
                images_2d.push(image);
            }
        }

        stager.flush(ctx)?;
        Ok((images_2d, images_3d))
    }

    /// 销毁不在缓存中的 image，缓存中的保持不变
    pub fn destroy_uncached_images<B: GpuBackend>(
        &self,
        ctx: &mut CgpuContext<B>,
        images: &[ImageHandle],
    ) -> anyhow::Result<()> {
        for image in images.iter().filter(|image| !self.is_cached(**image)) {
            ctx.destroy_image(*image)?;
        }
        Ok(())
    }

    pub fn evict_and_destroy_cached_image<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        image: ImageHandle,
    ) -> anyhow::Result<()> {
        let Some(path) = self.image_cache.iter().find(|(_, cached)| **cached == image).map(|(path, _)| path.clone())
        else {
            bail!("image {:?} is not in the texture cache", image);
        };

        self.image_cache.remove(&path);
        log::debug!("evicted image {}", path.display());
        ctx.destroy_image(image)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_and_stage<B: GpuBackend>(
        &mut self,
        ctx: &mut CgpuContext<B>,
        stager: &mut dyn Stager<B>,
        texels: &[u8],
        width: u32,
        height: u32,
        depth: u32,
        is_3d: bool,
    ) -> anyhow::Result<ImageHandle> {
        let desc = ImageDesc {
            width,
            height,
            depth,
            is_3d,
            format: ImageFormat::R8G8B8A8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        };
        let image = ctx.create_image(self.device, &desc)?;

        if let Err(e) = stager.stage_to_image(ctx, texels, image, width, height, depth) {
            // 失败前可能已经录制了部分拷贝，等到 destroy 时再销毁
            self.destroyer.enqueue(PendingDestroy::Image(image));
            return Err(e).context("failed to stage image");
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_reader::FsAssetReader;
    use gatling_cgpu::{CgpuConfig, EmulatedBackend, EmulatedConfig};
    use gatling_ggpu::{StagerConfig, StagerKind, SyncStager};

    struct Fixture {
        ctx: CgpuContext<EmulatedBackend>,
        device: DeviceHandle,
        stager: SyncStager,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let mut ctx = CgpuContext::initialize(EmulatedBackend::new(EmulatedConfig::default()), CgpuConfig::default());
            let device = ctx.create_device(0).unwrap();
            let config = StagerConfig {
                kind: StagerKind::Synchronous,
                buffer_size: 1 << 16,
                ..Default::default()
            };
            let stager = SyncStager::allocate(&mut ctx, device, &config).unwrap();
            Self {
                ctx,
                device,
                stager,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn texsys(&self) -> TexSys {
            TexSys::new(self.device, Box::new(FsAssetReader::with_root(self.dir.path())))
        }

        fn write_png(&self, name: &str, pixel: [u8; 4]) {
            let img = image::RgbaImage::from_pixel(2, 3, image::Rgba(pixel));
            img.save(self.dir.path().join(name)).unwrap();
        }

        fn contents(&self, image: ImageHandle) -> Vec<u8> {
            self.ctx.image_native(image).unwrap().contents()
        }

        fn shutdown(mut self) {
            Stager::free(&mut self.stager, &mut self.ctx).unwrap();
            self.ctx.destroy_device(self.device).unwrap();
            self.ctx.terminate().unwrap();
        }
    }

    #[test]
    fn test_cache_hit_returns_same_image() {
        let mut fx = Fixture::new();
        fx.write_png("red.png", [255, 0, 0, 255]);
        let mut texsys = fx.texsys();

        let path = Path::new("red.png");
        let first = texsys.load_texture_from_file_path(&mut fx.ctx, &mut fx.stager, path, false, true).unwrap();
        let second = texsys.load_texture_from_file_path(&mut fx.ctx, &mut fx.stager, path, false, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(texsys.cached_image_count(), 1);
        assert_eq!(fx.contents(first), [255u8, 0, 0, 255].repeat(6));

        texsys.destroy(&mut fx.ctx).unwrap();
        fx.shutdown();
    }

    #[test]
    fn test_failed_upload_is_destroyed_with_texsys() {
        let mut fx = Fixture::new();
        let mut texsys = fx.texsys();
        let live_before = fx.ctx.live_object_count();

        let resources = vec![TextureResource {
            source: TextureSource::Payload {
                width: 2,
                height: 2,
                depth: 1,
                data: vec![1; 12],
            },
            is_3d: false,
        }];
        assert!(texsys.load_texture_resources(&mut fx.ctx, &mut fx.stager, &resources).is_err());

        // image 没有立即销毁，stager 中可能还有指向它的拷贝
        assert_eq!(texsys.pending_destroy_count(), 1);
        assert_eq!(fx.ctx.live_object_count(), live_before + 1);

        Stager::flush(&mut fx.stager, &mut fx.ctx).unwrap();
        texsys.destroy(&mut fx.ctx).unwrap();
        assert_eq!(texsys.pending_destroy_count(), 0);
        assert_eq!(fx.ctx.live_object_count(), live_before);
        fx.shutdown();
    }

    #[test]
    fn test_load_resources_with_fallback() {
        let mut fx = Fixture::new();
        fx.write_png("green.png", [0, 255, 0, 255]);
        let mut texsys = fx.texsys();

        let resources = vec![
            TextureResource {
                source: TextureSource::Payload {
                    width: 1,
                    height: 1,
                    depth: 2,
                    data: vec![9; 8],
                },
                is_3d: true,
            },
            TextureResource {
                source: TextureSource::Path("green.png".into()),
                is_3d: false,
            },
            TextureResource {
                source: TextureSource::Path("missing.png".into()),
                is_3d: false,
            },
            TextureResource {
                source: TextureSource::Payload {
                    width: 1,
                    height: 1,
                    depth: 1,
                    data: vec![],
                },
                is_3d: false,
            },
        ];
        let (images_2d, images_3d) = texsys.load_texture_resources(&mut fx.ctx, &mut fx.stager, &resources).unwrap();
        assert_eq!(images_2d.len(), 2);
        assert_eq!(images_3d.len(), 1);
        assert_eq!(fx.contents(images_3d[0]), vec![9u8; 8]);
        assert_eq!(fx.contents(images_2d[1]), vec![0u8; 4]);
        assert_eq!(Stager::<EmulatedBackend>::staged_bytes(&fx.stager), 0);

        texsys.destroy_uncached_images(&mut fx.ctx, &images_2d).unwrap();
        texsys.destroy_uncached_images(&mut fx.ctx, &images_3d).unwrap();
        // 缓存中的 image 仍然有效
        assert!(fx.ctx.image_desc(images_2d[0]).is_ok());
        assert!(fx.ctx.image_desc(images_2d[1]).is_err());

        texsys.evict_and_destroy_cached_image(&mut fx.ctx, images_2d[0]).unwrap();
        assert_eq!(texsys.cached_image_count(), 0);
        assert!(texsys.evict_and_destroy_cached_image(&mut fx.ctx, images_2d[0]).is_err());

        texsys.destroy(&mut fx.ctx).unwrap();
        fx.shutdown();
    }
}
