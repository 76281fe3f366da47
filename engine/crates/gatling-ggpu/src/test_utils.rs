//! 在模拟后端上搭建测试环境

use gatling_cgpu::{
    BufferDesc, BufferHandle, BufferUsage, CgpuConfig, CgpuContext, DeviceHandle, EmulatedBackend, EmulatedConfig,
    EmulatedStats, ImageHandle, MemoryProperties,
};

pub struct TestGpu {
    pub ctx: CgpuContext<EmulatedBackend>,
    pub device: DeviceHandle,
}

impl TestGpu {
    pub fn new() -> Self {
        Self::with_config(EmulatedConfig::default())
    }

    /// 没有同时 device local 与 host visible 的内存类型
    pub fn without_rebar() -> Self {
        Self::with_config(EmulatedConfig::default().without_rebar())
    }

    fn with_config(config: EmulatedConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ctx = CgpuContext::initialize(EmulatedBackend::new(config), CgpuConfig::default());
        let device = ctx.create_device(0).unwrap();
        Self { ctx, device }
    }

    pub fn device_local_buffer(&mut self, size: u64) -> BufferHandle {
        let desc = BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_DST | BufferUsage::STORAGE,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
        };
        self.ctx.create_buffer(self.device, &desc).unwrap()
    }

    pub fn contents(&self, buffer: BufferHandle) -> Vec<u8> {
        self.ctx.buffer_native(buffer).unwrap().contents()
    }

    pub fn image_contents(&self, image: ImageHandle) -> Vec<u8> {
        self.ctx.image_native(image).unwrap().contents()
    }

    /// 通过映射读取，走一遍 invalidate
    pub fn read_mapped(&mut self, buffer: BufferHandle, offset: u64, len: usize) -> Vec<u8> {
        let ptr = self.ctx.map_buffer(buffer).unwrap();
        self.ctx.invalidate_mapped_memory(buffer, offset, len as u64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(offset as usize), len).to_vec() };
        self.ctx.unmap_buffer(buffer).unwrap();
        bytes
    }

    pub fn stats(&self) -> &EmulatedStats {
        self.ctx.backend().stats()
    }

    /// 所有对象都必须已经销毁
    pub fn shutdown(mut self) {
        self.ctx.destroy_device(self.device).unwrap();
        assert_eq!(self.ctx.live_object_count(), 0);
        self.ctx.terminate().unwrap();
    }
}

/// 用 seed 循环填充 len 个字节，每一轮加上轮次，避免周期性内容掩盖偏移错误
pub fn pattern(seed: &[u8], len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed[i % seed.len()].wrapping_add((i / seed.len()) as u8))
        .collect()
}
