use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use gatling_cgpu::{
    BufferDesc, BufferHandle, BufferUsage, CgpuContext, DeviceHandle, GpuBackend, MemoryProperties,
};
use gatling_ggpu::{Stager, create_stager};
use gatling_texsys::{FsAssetReader, TexSys, TextureResource, TextureSource};

use crate::config::{GatlingConfig, UploadConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub pattern_bytes: u64,
    pub textures_2d: usize,
    pub textures_3d: usize,
    pub elapsed: Duration,
}

/// 按字节下标生成的校验数据，周期与常见的 2 的幂次大小错开
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i >> 8) as u8).collect()
}

/// 创建设备、上传 pattern 与纹理、回读校验，然后按相反的顺序销毁所有对象
pub fn run_upload<B: GpuBackend>(ctx: &mut CgpuContext<B>, config: &GatlingConfig) -> anyhow::Result<UploadReport> {
    let _span = tracy_client::span!("run_upload");

    let device = ctx
        .create_device(config.cgpu.device_index)
        .with_context(|| format!("创建设备 {} 失败", config.cgpu.device_index))?;

    let result = upload_on_device(ctx, device, config);

    if let Err(e) = ctx.destroy_device(device) {
        log::error!("failed to destroy device: {}", e);
    }
    result
}

fn upload_on_device<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    config: &GatlingConfig,
) -> anyhow::Result<UploadReport> {
    let mut stager = create_stager(ctx, device, &config.stager).context("创建 stager 失败")?;
    log::info!("{:?} stager with {} bytes per region", config.stager.kind, stager.capacity());

    let start = Instant::now();
    let result = upload_pattern(ctx, device, stager.as_mut(), config.upload.pattern_size).and_then(|()| {
        let (textures_2d, textures_3d) = upload_textures(ctx, device, stager.as_mut(), &config.upload)?;
        Ok(UploadReport {
            pattern_bytes: config.upload.pattern_size,
            textures_2d,
            textures_3d,
            elapsed: start.elapsed(),
        })
    });

    if let Err(e) = stager.free(ctx) {
        log::error!("failed to free stager: {}", e);
    }
    result
}

fn upload_pattern<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    stager: &mut dyn Stager<B>,
    size: u64,
) -> anyhow::Result<()> {
    if size == 0 {
        return Ok(());
    }
    let _span = tracy_client::span!("upload_pattern");

    let target = create_buffer(
        ctx,
        device,
        size,
        BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | BufferUsage::STORAGE,
        MemoryProperties::DEVICE_LOCAL,
    )?;
    let readback = match create_buffer(
        ctx,
        device,
        size,
        BufferUsage::TRANSFER_DST,
        MemoryProperties::HOST_VISIBLE,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            destroy_buffer(ctx, target);
            return Err(e);
        }
    };

    let result = (|| -> anyhow::Result<()> {
        let data = pattern(size);
        stager.stage_to_buffer(ctx, &data, target, 0)?;
        stager.flush(ctx)?;
        stager.wait_idle(ctx)?;

        copy_and_wait(ctx, device, target, readback, size)?;
        verify_readback(ctx, readback, &data)
    })();

    destroy_buffer(ctx, readback);
    destroy_buffer(ctx, target);
    result
}

fn upload_textures<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    stager: &mut dyn Stager<B>,
    config: &UploadConfig,
) -> anyhow::Result<(usize, usize)> {
    if config.textures.is_empty() {
        return Ok((0, 0));
    }
    let _span = tracy_client::span!("upload_textures");

    let reader = match &config.asset_root {
        Some(root) => FsAssetReader::with_root(root),
        None => FsAssetReader::new(),
    };
    let mut texsys = TexSys::new(device, Box::new(reader));
    let resources = config
        .textures
        .iter()
        .map(|path| TextureResource {
            source: TextureSource::Path(path.clone()),
            is_3d: false,
        })
        .collect::<Vec<_>>();

    let result = texsys.load_texture_resources(ctx, stager, &resources).and_then(|(images_2d, images_3d)| {
        let counts = (images_2d.len(), images_3d.len());
        let waited = stager.wait_idle(ctx).map_err(anyhow::Error::from);
        texsys.destroy_uncached_images(ctx, &images_2d)?;
        texsys.destroy_uncached_images(ctx, &images_3d)?;
        waited.map(|()| counts)
    });

    // 上传失败时 stager 中可能还有指向待销毁 image 的拷贝
    if let Err(e) = stager.flush(ctx).and_then(|()| stager.wait_idle(ctx)) {
        log::error!("failed to drain stager: {}", e);
    }
    if let Err(e) = texsys.destroy(ctx) {
        log::error!("failed to destroy texture cache: {:#}", e);
    }
    result
}

fn create_buffer<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    size: u64,
    usage: BufferUsage,
    memory_properties: MemoryProperties,
) -> anyhow::Result<BufferHandle> {
    let desc = BufferDesc {
        size,
        usage,
        memory_properties,
    };
    ctx.create_buffer(device, &desc)
        .with_context(|| format!("创建 {} 字节的 buffer 失败", size))
}

fn destroy_buffer<B: GpuBackend>(ctx: &mut CgpuContext<B>, buffer: BufferHandle) {
    if let Err(e) = ctx.destroy_buffer(buffer) {
        log::warn!("failed to destroy buffer: {}", e);
    }
}

fn copy_and_wait<B: GpuBackend>(
    ctx: &mut CgpuContext<B>,
    device: DeviceHandle,
    src: BufferHandle,
    dst: BufferHandle,
    size: u64,
) -> anyhow::Result<()> {
    let command_buffer = ctx.create_command_buffer(device)?;
    let fence = match ctx.create_fence(device) {
        Ok(fence) => fence,
        Err(e) => {
            if let Err(e) = ctx.destroy_command_buffer(command_buffer) {
                log::warn!("failed to destroy command buffer: {}", e);
            }
            return Err(e.into());
        }
    };

    let result = (|| -> anyhow::Result<()> {
        ctx.begin_command_buffer(command_buffer)?;
        ctx.cmd_copy_buffer(command_buffer, src, 0, dst, 0, size)?;
        ctx.end_command_buffer(command_buffer)?;
        ctx.reset_fence(fence)?;
        ctx.submit_command_buffer(command_buffer, fence)?;
        ctx.wait_for_fence(fence)?;
        Ok(())
    })();

    if let Err(e) = ctx.destroy_fence(fence) {
        log::warn!("failed to destroy fence: {}", e);
    }
    if let Err(e) = ctx.destroy_command_buffer(command_buffer) {
        log::warn!("failed to destroy command buffer: {}", e);
    }
    result
}

fn verify_readback<B: GpuBackend>(ctx: &mut CgpuContext<B>, readback: BufferHandle, expected: &[u8]) -> anyhow::Result<()> {
    let mapped = ctx.map_buffer(readback)?;
    let result = ctx
        .invalidate_mapped_memory(readback, 0, expected.len() as u64)
        .map(|()| unsafe { std::slice::from_raw_parts(mapped.as_ptr(), expected.len()) }.to_vec());
    ctx.unmap_buffer(readback)?;
    let actual = result?;

    if let Some(offset) = actual.iter().zip(expected).position(|(a, e)| a != e) {
        bail!(
            "readback mismatch at byte {}: expected {:#04x}, got {:#04x}",
            offset,
            expected[offset],
            actual[offset]
        );
    }
    log::info!("verified {} bytes", expected.len());
    Ok(())
}
