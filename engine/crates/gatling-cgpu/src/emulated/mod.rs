//! 在主机内存上模拟的计算设备
//!
//! 命令在录制时被保存下来，提交后排队，直到有人等待对应的 fence 时才按提交顺序执行。
//! 这样 stager 的 fence 协议在没有 GPU 的环境下也可以被完整地观察和测试。
//! dispatch 只计数，不执行 shader。

mod command;
pub mod memory;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::backend::GpuBackend;
use crate::basic::desc::{
    BufferBinding, BufferDesc, BufferImageCopyDesc, ImageBinding, ImageDesc, MemoryBarrier, ResolvedBufferBarrier,
};
use crate::basic::flags::{MemoryProperties, ResourceAccess};
use crate::basic::limits::DeviceLimits;
use crate::context::MAX_TIMESTAMP_QUERIES;
use crate::error::{CgpuError, CgpuResult};
use crate::foundation::memory::find_memory_type_index;

use command::{Command, ExecutionState, Submission};
pub use command::CommandBufferState;
use memory::HostMemory;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    pub device_count: u32,
    /// 按 first-fit 顺序排列的内存类型
    pub memory_types: Vec<MemoryProperties>,
    pub limits: DeviceLimits,
    pub supported_extensions: Vec<String>,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            memory_types: vec![
                MemoryProperties::DEVICE_LOCAL,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_CACHED,
                // ReBAR
                MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            ],
            limits: DeviceLimits::default(),
            supported_extensions: vec![],
        }
    }
}

impl EmulatedConfig {
    /// 去掉同时 device local 与 host visible 的内存类型
    pub fn without_rebar(mut self) -> Self {
        self.memory_types.retain(|properties| {
            !properties.contains(MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE)
        });
        self
    }
}

/// 可观察的计数器，测试用它检查提交与同步的次数
#[derive(Debug, Default)]
pub struct EmulatedStats {
    submits: Cell<u64>,
    fence_waits: Cell<u64>,
    fence_resets: Cell<u64>,
    memory_flushes: Cell<u64>,
    memory_invalidates: Cell<u64>,
    dispatches: Cell<u64>,
    live_mappings: Cell<u64>,
}

impl EmulatedStats {
    fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }

    #[inline]
    pub fn submits(&self) -> u64 {
        self.submits.get()
    }
    #[inline]
    pub fn fence_waits(&self) -> u64 {
        self.fence_waits.get()
    }
    #[inline]
    pub fn fence_resets(&self) -> u64 {
        self.fence_resets.get()
    }
    #[inline]
    pub fn memory_flushes(&self) -> u64 {
        self.memory_flushes.get()
    }
    #[inline]
    pub fn memory_invalidates(&self) -> u64 {
        self.memory_invalidates.get()
    }
    #[inline]
    pub fn dispatches(&self) -> u64 {
        self.dispatches.get()
    }
    #[inline]
    pub fn live_mappings(&self) -> u64 {
        self.live_mappings.get()
    }
}

pub struct EmulatedDevice {
    index: u32,
    memory_types: Vec<MemoryProperties>,
    limits: DeviceLimits,
    pending: RefCell<VecDeque<Submission>>,
    timestamps: RefCell<Vec<Option<u64>>>,
    clock: Cell<u64>,
    stats: Rc<EmulatedStats>,
}

impl EmulatedDevice {
    /// 执行队列中的提交，直到 `fence` 所属的提交完成
    fn drain_until(&self, fence: &Rc<Cell<bool>>) -> bool {
        let mut timestamps = self.timestamps.borrow_mut();
        let mut state = ExecutionState {
            timestamps: timestamps.as_mut_slice(),
            clock: &self.clock,
            dispatches: &self.stats.dispatches,
        };

        let mut pending = self.pending.borrow_mut();
        while let Some(submission) = pending.pop_front() {
            for command in &submission.commands {
                command.execute(&mut state);
            }
            submission.fence.set(true);
            if Rc::ptr_eq(&submission.fence, fence) {
                return true;
            }
        }
        false
    }
}

pub struct EmulatedBuffer {
    memory: Rc<HostMemory>,
    properties: MemoryProperties,
}

impl EmulatedBuffer {
    /// 不经过映射直接读取内容，只用于测试
    pub fn contents(&self) -> Vec<u8> {
        self.memory.read(0, self.memory.len() as u64)
    }

    #[inline]
    pub fn memory_properties(&self) -> MemoryProperties {
        self.properties
    }
}

pub struct EmulatedImage {
    memory: Rc<HostMemory>,
    desc: ImageDesc,
    properties: MemoryProperties,
    general_layout: bool,
}

impl EmulatedImage {
    /// 按 x、y、z 顺序紧密排列的 texel 数据
    pub fn contents(&self) -> Vec<u8> {
        self.memory.read(0, self.memory.len() as u64)
    }

    /// 是否已经转换到 general layout
    #[inline]
    pub fn is_general_layout(&self) -> bool {
        self.general_layout
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

pub struct EmulatedShader {
    word_count: usize,
}

pub struct EmulatedPipeline {
    declared_bindings: BTreeSet<u32>,
    written_bindings: BTreeSet<u32>,
    push_constants_size: u32,
}

impl EmulatedPipeline {
    /// 已经写入 descriptor 的绑定编号
    pub fn written_bindings(&self) -> Vec<u32> {
        self.written_bindings.iter().copied().collect()
    }

    #[inline]
    pub fn push_constants_size(&self) -> u32 {
        self.push_constants_size
    }
}

pub struct EmulatedCommandBuffer {
    state: CommandBufferState,
    commands: Vec<Command>,
}

impl EmulatedCommandBuffer {
    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    #[inline]
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    fn record(&mut self, command: Command) -> CgpuResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(CgpuError::CommandBufferNotRecording);
        }
        self.commands.push(command);
        Ok(())
    }
}

pub struct EmulatedFence {
    signaled: Rc<Cell<bool>>,
}

pub struct EmulatedBackend {
    config: EmulatedConfig,
    stats: Rc<EmulatedStats>,
}

impl EmulatedBackend {
    pub fn new(config: EmulatedConfig) -> Self {
        Self {
            config,
            stats: Rc::new(EmulatedStats::default()),
        }
    }

    #[inline]
    pub fn stats(&self) -> &EmulatedStats {
        &self.stats
    }

    fn allocate(device: &EmulatedDevice, size: u64, required: MemoryProperties) -> CgpuResult<(Rc<HostMemory>, MemoryProperties)> {
        let type_index = find_memory_type_index(&device.memory_types, !0, required)?;
        let memory = HostMemory::new(size)?;
        Ok((Rc::new(memory), device.memory_types[type_index as usize]))
    }

    fn descriptor_bindings(
        buffers: &[BufferBinding<'_, EmulatedBuffer>],
        images: &[ImageBinding<'_, EmulatedImage>],
        filter: impl Fn(ResourceAccess) -> bool,
    ) -> BTreeSet<u32> {
        buffers
            .iter()
            .filter(|b| filter(b.access))
            .map(|b| b.binding)
            .chain(images.iter().filter(|i| filter(i.access)).map(|i| i.binding))
            .collect()
    }
}

impl Default for EmulatedBackend {
    fn default() -> Self {
        Self::new(EmulatedConfig::default())
    }
}

impl GpuBackend for EmulatedBackend {
    type Device = EmulatedDevice;
    type Buffer = EmulatedBuffer;
    type Image = EmulatedImage;
    type Shader = EmulatedShader;
    type Pipeline = EmulatedPipeline;
    type CommandBuffer = EmulatedCommandBuffer;
    type Fence = EmulatedFence;

    fn name(&self) -> &'static str {
        "emulated"
    }

    fn physical_device_count(&self) -> CgpuResult<u32> {
        Ok(self.config.device_count)
    }

    fn create_device(&self, index: u32, required_extensions: &[String]) -> CgpuResult<EmulatedDevice> {
        if index >= self.config.device_count {
            return Err(CgpuError::NoDeviceAtIndex(index));
        }
        if let Some(missing) = required_extensions.iter().find(|ext| !self.config.supported_extensions.contains(ext)) {
            log::error!("emulated device {} does not support extension {}", index, missing);
            return Err(CgpuError::DeviceExtensionNotSupported(missing.clone()));
        }

        log::info!("emulated device {} created with {} memory types", index, self.config.memory_types.len());
        Ok(EmulatedDevice {
            index,
            memory_types: self.config.memory_types.clone(),
            limits: self.config.limits,
            pending: RefCell::new(VecDeque::new()),
            timestamps: RefCell::new(vec![None; MAX_TIMESTAMP_QUERIES as usize]),
            clock: Cell::new(0),
            stats: self.stats.clone(),
        })
    }

    fn destroy_device(&self, device: EmulatedDevice) {
        log::info!("destroying emulated device {}", device.index);
    }

    fn device_limits(&self, device: &EmulatedDevice) -> DeviceLimits {
        device.limits
    }

    fn create_buffer(&self, device: &EmulatedDevice, desc: &BufferDesc) -> CgpuResult<EmulatedBuffer> {
        let (memory, properties) = Self::allocate(device, desc.size, desc.memory_properties)?;
        Ok(EmulatedBuffer { memory, properties })
    }

    fn destroy_buffer(&self, _device: &EmulatedDevice, _buffer: EmulatedBuffer) {}

    fn map_buffer(&self, _device: &EmulatedDevice, buffer: &mut EmulatedBuffer) -> CgpuResult<NonNull<u8>> {
        if !buffer.properties.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(CgpuError::UnableToMapMemory);
        }
        EmulatedStats::bump(&self.stats.live_mappings);
        Ok(buffer.memory.ptr())
    }

    fn unmap_buffer(&self, _device: &EmulatedDevice, _buffer: &mut EmulatedBuffer) {
        self.stats.live_mappings.set(self.stats.live_mappings.get().saturating_sub(1));
    }

    fn flush_mapped_memory(&self, _device: &EmulatedDevice, _buffer: &EmulatedBuffer, _offset: u64, _size: u64) -> CgpuResult<()> {
        EmulatedStats::bump(&self.stats.memory_flushes);
        Ok(())
    }

    fn invalidate_mapped_memory(
        &self,
        _device: &EmulatedDevice,
        _buffer: &EmulatedBuffer,
        _offset: u64,
        _size: u64,
    ) -> CgpuResult<()> {
        EmulatedStats::bump(&self.stats.memory_invalidates);
        Ok(())
    }

    fn create_image(&self, device: &EmulatedDevice, desc: &ImageDesc) -> CgpuResult<EmulatedImage> {
        let (memory, properties) = Self::allocate(device, desc.byte_size(), desc.memory_properties)?;
        Ok(EmulatedImage {
            memory,
            desc: *desc,
            properties,
            general_layout: false,
        })
    }

    fn destroy_image(&self, _device: &EmulatedDevice, _image: EmulatedImage) {}

    fn map_image(&self, _device: &EmulatedDevice, image: &mut EmulatedImage) -> CgpuResult<NonNull<u8>> {
        if !image.properties.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(CgpuError::UnableToMapMemory);
        }
        EmulatedStats::bump(&self.stats.live_mappings);
        Ok(image.memory.ptr())
    }

    fn unmap_image(&self, _device: &EmulatedDevice, _image: &mut EmulatedImage) {
        self.stats.live_mappings.set(self.stats.live_mappings.get().saturating_sub(1));
    }

    fn create_shader(&self, _device: &EmulatedDevice, spirv: &[u8]) -> CgpuResult<EmulatedShader> {
        if spirv.len() < 4 || spirv.len() % 4 != 0 {
            return Err(CgpuError::UnableToCreateShaderModule);
        }
        let magic = u32::from_le_bytes([spirv[0], spirv[1], spirv[2], spirv[3]]);
        if magic != SPIRV_MAGIC {
            return Err(CgpuError::UnableToCreateShaderModule);
        }
        Ok(EmulatedShader {
            word_count: spirv.len() / 4,
        })
    }

    fn destroy_shader(&self, _device: &EmulatedDevice, shader: EmulatedShader) {
        log::trace!("destroying emulated shader of {} words", shader.word_count);
    }

    fn create_pipeline(
        &self,
        _device: &EmulatedDevice,
        _shader: &EmulatedShader,
        buffers: &[BufferBinding<'_, EmulatedBuffer>],
        images: &[ImageBinding<'_, EmulatedImage>],
        push_constants_size: u32,
    ) -> CgpuResult<EmulatedPipeline> {
        Ok(EmulatedPipeline {
            declared_bindings: Self::descriptor_bindings(buffers, images, |_| true),
            written_bindings: Self::descriptor_bindings(buffers, images, |access| access.contains(ResourceAccess::WRITE)),
            push_constants_size,
        })
    }

    fn update_pipeline_bindings(
        &self,
        _device: &EmulatedDevice,
        pipeline: &mut EmulatedPipeline,
        buffers: &[BufferBinding<'_, EmulatedBuffer>],
        images: &[ImageBinding<'_, EmulatedImage>],
    ) -> CgpuResult<()> {
        let bindings = Self::descriptor_bindings(buffers, images, |_| true);
        if !bindings.is_subset(&pipeline.declared_bindings) {
            return Err(CgpuError::UnableToAllocateDescriptorSet);
        }
        pipeline.written_bindings.extend(bindings);
        Ok(())
    }

    fn destroy_pipeline(&self, _device: &EmulatedDevice, _pipeline: EmulatedPipeline) {}

    fn create_command_buffer(&self, _device: &EmulatedDevice) -> CgpuResult<EmulatedCommandBuffer> {
        Ok(EmulatedCommandBuffer {
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        })
    }

    fn destroy_command_buffer(&self, _device: &EmulatedDevice, _command_buffer: EmulatedCommandBuffer) {}

    fn begin_command_buffer(&self, _device: &EmulatedDevice, command_buffer: &mut EmulatedCommandBuffer) -> CgpuResult<()> {
        if command_buffer.state == CommandBufferState::Recording {
            return Err(CgpuError::UnableToBeginCommandBuffer);
        }
        command_buffer.commands.clear();
        command_buffer.state = CommandBufferState::Recording;
        Ok(())
    }

    fn end_command_buffer(&self, _device: &EmulatedDevice, command_buffer: &mut EmulatedCommandBuffer) -> CgpuResult<()> {
        if command_buffer.state != CommandBufferState::Recording {
            return Err(CgpuError::UnableToEndCommandBuffer);
        }
        command_buffer.state = CommandBufferState::Executable;
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        _pipeline: &EmulatedPipeline,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::BindPipeline)
    }

    fn cmd_copy_buffer(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        src: &EmulatedBuffer,
        src_offset: u64,
        dst: &EmulatedBuffer,
        dst_offset: u64,
        size: u64,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::CopyBuffer {
            src: src.memory.clone(),
            src_offset,
            dst: dst.memory.clone(),
            dst_offset,
            size,
        })
    }

    fn cmd_update_buffer(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        data: &[u8],
        dst: &EmulatedBuffer,
        dst_offset: u64,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::UpdateBuffer {
            data: data.to_vec(),
            dst: dst.memory.clone(),
            dst_offset,
        })
    }

    fn cmd_copy_buffer_to_image(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        src: &EmulatedBuffer,
        dst: &mut EmulatedImage,
        region: &BufferImageCopyDesc,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::CopyBufferToImage {
            src: src.memory.clone(),
            dst: dst.memory.clone(),
            image_extent: [dst.desc.width, dst.desc.height],
            texel_size: dst.desc.format.texel_size(),
            region: *region,
        })?;
        dst.general_layout = true;
        Ok(())
    }

    fn cmd_push_constants(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        _pipeline: &EmulatedPipeline,
        _data: &[u8],
    ) -> CgpuResult<()> {
        command_buffer.record(Command::PushConstants)
    }

    fn cmd_dispatch(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        _group_count: [u32; 3],
    ) -> CgpuResult<()> {
        command_buffer.record(Command::Dispatch)
    }

    fn cmd_pipeline_barrier(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        _barriers: &[MemoryBarrier],
        _buffer_barriers: &[ResolvedBufferBarrier<'_, EmulatedBuffer>],
    ) -> CgpuResult<()> {
        command_buffer.record(Command::Barrier)
    }

    fn cmd_reset_timestamps(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        offset: u32,
        count: u32,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::ResetTimestamps { offset, count })
    }

    fn cmd_write_timestamp(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        index: u32,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::WriteTimestamp { index })
    }

    fn cmd_copy_timestamps(
        &self,
        _device: &EmulatedDevice,
        command_buffer: &mut EmulatedCommandBuffer,
        buffer: &EmulatedBuffer,
        offset: u32,
        count: u32,
        _wait_until_available: bool,
    ) -> CgpuResult<()> {
        command_buffer.record(Command::CopyTimestamps {
            dst: buffer.memory.clone(),
            offset,
            count,
        })
    }

    fn create_fence(&self, _device: &EmulatedDevice) -> CgpuResult<EmulatedFence> {
        Ok(EmulatedFence {
            signaled: Rc::new(Cell::new(true)),
        })
    }

    fn destroy_fence(&self, _device: &EmulatedDevice, _fence: EmulatedFence) {}

    fn reset_fence(&self, _device: &EmulatedDevice, fence: &EmulatedFence) -> CgpuResult<()> {
        EmulatedStats::bump(&self.stats.fence_resets);
        fence.signaled.set(false);
        Ok(())
    }

    fn wait_for_fence(&self, device: &EmulatedDevice, fence: &EmulatedFence) -> CgpuResult<()> {
        EmulatedStats::bump(&self.stats.fence_waits);
        if fence.signaled.get() {
            return Ok(());
        }
        if !device.drain_until(&fence.signaled) {
            // 真实设备上这里会永远阻塞
            log::error!("waiting on a fence that no submission will signal");
            return Err(CgpuError::UnableToWaitForFence);
        }
        Ok(())
    }

    fn submit_command_buffer(
        &self,
        device: &EmulatedDevice,
        command_buffer: &EmulatedCommandBuffer,
        fence: &EmulatedFence,
    ) -> CgpuResult<()> {
        if command_buffer.state != CommandBufferState::Executable || fence.signaled.get() {
            log::error!("submit requires an ended command buffer and an unsignaled fence");
            return Err(CgpuError::UnableToSubmitCommandBuffer);
        }
        EmulatedStats::bump(&self.stats.submits);
        device.pending.borrow_mut().push_back(Submission {
            commands: command_buffer.commands.clone(),
            fence: fence.signaled.clone(),
        });
        Ok(())
    }

    fn destroy_instance(&mut self) {
        log::info!("destroying emulated instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::desc::{PipelineDesc, ShaderResourceBuffer, ShaderResourceImage};
    use crate::basic::flags::{BufferUsage, ImageUsage, WHOLE_SIZE};
    use crate::basic::format::ImageFormat;
    use crate::context::{CgpuConfig, CgpuContext};
    use crate::handle::object_table::ResolveMode;
    use crate::handle::typed::{BufferHandle, DeviceHandle};

    fn setup() -> (CgpuContext<EmulatedBackend>, DeviceHandle) {
        let mut ctx = CgpuContext::initialize(EmulatedBackend::default(), CgpuConfig::default());
        let device = ctx.create_device(0).unwrap();
        (ctx, device)
    }

    fn host_buffer(ctx: &mut CgpuContext<EmulatedBackend>, device: DeviceHandle, size: u64) -> BufferHandle {
        ctx.create_buffer(
            device,
            &BufferDesc {
                size,
                usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | BufferUsage::STORAGE,
                memory_properties: MemoryProperties::HOST_VISIBLE,
            },
        )
        .unwrap()
    }

    fn spirv() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0].iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_copy_executes_on_fence_wait() {
        let (mut ctx, device) = setup();
        let src = host_buffer(&mut ctx, device, 64);
        let dst = host_buffer(&mut ctx, device, 64);
        ctx.buffer_native(src).unwrap().memory.write(0, &[7u8; 64]);

        let cmd = ctx.create_command_buffer(device).unwrap();
        let fence = ctx.create_fence(device).unwrap();
        ctx.begin_command_buffer(cmd).unwrap();
        ctx.cmd_copy_buffer(cmd, src, 16, dst, 0, 32).unwrap();
        ctx.end_command_buffer(cmd).unwrap();
        ctx.reset_fence(fence).unwrap();
        ctx.submit_command_buffer(cmd, fence).unwrap();

        // 提交后尚未执行
        assert!(ctx.buffer_native(dst).unwrap().contents().iter().all(|b| *b == 0));
        ctx.wait_for_fence(fence).unwrap();
        let contents = ctx.buffer_native(dst).unwrap().contents();
        assert_eq!(&contents[..32], &[7u8; 32]);
        assert_eq!(&contents[32..], &[0u8; 32]);
        assert_eq!(ctx.backend().stats().submits(), 1);

        ctx.destroy_fence(fence).unwrap();
        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_buffer(src).unwrap();
        ctx.destroy_buffer(dst).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_submit_with_signaled_fence_fails() {
        let (mut ctx, device) = setup();
        let cmd = ctx.create_command_buffer(device).unwrap();
        let fence = ctx.create_fence(device).unwrap();
        ctx.begin_command_buffer(cmd).unwrap();
        ctx.end_command_buffer(cmd).unwrap();
        assert_eq!(ctx.submit_command_buffer(cmd, fence), Err(CgpuError::UnableToSubmitCommandBuffer));

        ctx.destroy_fence(fence).unwrap();
        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_recording_requires_begin() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 16);
        let cmd = ctx.create_command_buffer(device).unwrap();
        assert_eq!(ctx.cmd_copy_buffer(cmd, buffer, 0, buffer, 8, 8), Err(CgpuError::CommandBufferNotRecording));

        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_buffer(buffer).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_copy_bounds_are_validated() {
        let (mut ctx, device) = setup();
        let a = host_buffer(&mut ctx, device, 64);
        let b = host_buffer(&mut ctx, device, 32);
        let cmd = ctx.create_command_buffer(device).unwrap();
        ctx.begin_command_buffer(cmd).unwrap();

        assert_eq!(ctx.cmd_copy_buffer(cmd, a, 0, b, 0, 64), Err(CgpuError::CopyRegionOutOfBounds));
        assert_eq!(ctx.cmd_copy_buffer(cmd, a, 48, b, 0, WHOLE_SIZE), Ok(()));
        assert_eq!(ctx.cmd_update_buffer(cmd, &[0u8; 6], b, 0), Err(CgpuError::InlineUpdateTooLarge { size: 6, max: 65536 }));
        assert_eq!(ctx.cmd_update_buffer(cmd, &[0u8; 8], b, 28), Err(CgpuError::CopyRegionOutOfBounds));

        ctx.end_command_buffer(cmd).unwrap();
        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_buffer(a).unwrap();
        ctx.destroy_buffer(b).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_memory_type_selection() {
        let mut ctx = CgpuContext::initialize(EmulatedBackend::new(EmulatedConfig::default().without_rebar()), CgpuConfig::default());
        let device = ctx.create_device(0).unwrap();

        let rebar = BufferDesc {
            size: 16,
            usage: BufferUsage::TRANSFER_SRC,
            memory_properties: MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE,
        };
        assert_eq!(ctx.create_buffer(device, &rebar), Err(CgpuError::NoSuitableMemoryType));
        assert_eq!(ctx.live_object_count(), 1);

        let device_local = ctx
            .create_buffer(device, &BufferDesc { memory_properties: MemoryProperties::DEVICE_LOCAL, ..rebar })
            .unwrap();
        assert_eq!(ctx.map_buffer(device_local), Err(CgpuError::UnableToMapMemory));

        ctx.destroy_buffer(device_local).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_map_is_idempotent_and_tracked() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 32);
        let a = ctx.map_buffer(buffer).unwrap();
        let b = ctx.map_buffer(buffer).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.backend().stats().live_mappings(), 1);

        // 销毁时自动 unmap
        ctx.destroy_buffer(buffer).unwrap();
        assert_eq!(ctx.backend().stats().live_mappings(), 0);
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_buffer_to_image_copy() {
        let (mut ctx, device) = setup();
        let image = ctx
            .create_image(
                device,
                &ImageDesc {
                    width: 4,
                    height: 4,
                    depth: 1,
                    is_3d: false,
                    format: ImageFormat::R8Unorm,
                    usage: ImageUsage::TRANSFER_DST | ImageUsage::STORAGE,
                    memory_properties: MemoryProperties::DEVICE_LOCAL,
                },
            )
            .unwrap();
        let src = host_buffer(&mut ctx, device, 16);
        ctx.buffer_native(src).unwrap().memory.write(0, &[1, 2, 3, 4, 5, 6]);

        let cmd = ctx.create_command_buffer(device).unwrap();
        let fence = ctx.create_fence(device).unwrap();
        ctx.begin_command_buffer(cmd).unwrap();
        let region = BufferImageCopyDesc {
            buffer_offset: 0,
            texel_offset_x: 1,
            texel_offset_y: 2,
            texel_offset_z: 0,
            texel_extent_x: 3,
            texel_extent_y: 2,
            texel_extent_z: 1,
        };
        ctx.cmd_copy_buffer_to_image(cmd, src, image, &region).unwrap();
        assert!(ctx.image_native(image).unwrap().is_general_layout());

        let too_tall = BufferImageCopyDesc { texel_extent_y: 3, ..region };
        assert_eq!(ctx.cmd_copy_buffer_to_image(cmd, src, image, &too_tall), Err(CgpuError::CopyRegionOutOfBounds));
        let misaligned = BufferImageCopyDesc { buffer_offset: 2, ..region };
        assert_eq!(
            ctx.cmd_copy_buffer_to_image(cmd, src, image, &misaligned),
            Err(CgpuError::BufferOffsetNotAligned { offset: 2, alignment: 4 })
        );

        ctx.end_command_buffer(cmd).unwrap();
        ctx.reset_fence(fence).unwrap();
        ctx.submit_command_buffer(cmd, fence).unwrap();
        ctx.wait_for_fence(fence).unwrap();

        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 1, 2, 3,
            0, 4, 5, 6,
        ];
        assert_eq!(ctx.image_native(image).unwrap().contents(), expected);

        ctx.destroy_fence(fence).unwrap();
        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_buffer(src).unwrap();
        ctx.destroy_image(image).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_pipeline_writes_only_written_resources() {
        let (mut ctx, device) = setup();
        let input = host_buffer(&mut ctx, device, 256);
        let output = host_buffer(&mut ctx, device, 256);
        let shader = ctx.create_shader(device, &spirv()).unwrap();

        let buffers = [
            ShaderResourceBuffer { binding: 0, buffer: input, offset: 0, size: WHOLE_SIZE, access: ResourceAccess::READ },
            ShaderResourceBuffer { binding: 1, buffer: output, offset: 0, size: WHOLE_SIZE, access: ResourceAccess::WRITE },
        ];
        let pipeline = ctx
            .create_pipeline(
                device,
                &PipelineDesc { shader, buffers: &buffers, images: &[], push_constants_size: 16 },
            )
            .unwrap();
        assert_eq!(ctx.pipeline_native(pipeline).unwrap().written_bindings(), vec![1]);

        ctx.update_pipeline_bindings(pipeline, &buffers[..1], &[]).unwrap();
        assert_eq!(ctx.pipeline_native(pipeline).unwrap().written_bindings(), vec![0, 1]);

        // 未声明的绑定编号
        let undeclared = [ShaderResourceImage { binding: 5, image: crate::ImageHandle::NULL, access: ResourceAccess::READ }];
        assert_eq!(ctx.update_pipeline_bindings(pipeline, &[], &undeclared), Err(CgpuError::InvalidHandle));

        let cmd = ctx.create_command_buffer(device).unwrap();
        ctx.begin_command_buffer(cmd).unwrap();
        ctx.cmd_bind_pipeline(cmd, pipeline).unwrap();
        ctx.cmd_push_constants(cmd, pipeline, &[0u8; 16]).unwrap();
        assert_eq!(
            ctx.cmd_push_constants(cmd, pipeline, &[0u8; 20]),
            Err(CgpuError::PushConstantsTooLarge { size: 20, max: 16 })
        );
        ctx.cmd_dispatch(cmd, 4, 1, 1).unwrap();
        ctx.end_command_buffer(cmd).unwrap();

        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_pipeline(pipeline).unwrap();
        ctx.destroy_shader(shader).unwrap();
        ctx.destroy_buffer(input).unwrap();
        ctx.destroy_buffer(output).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_misaligned_binding_offset_is_rejected() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 256);
        let shader = ctx.create_shader(device, &spirv()).unwrap();
        let buffers =
            [ShaderResourceBuffer { binding: 0, buffer, offset: 4, size: 16, access: ResourceAccess::WRITE }];
        let result = ctx.create_pipeline(device, &PipelineDesc { shader, buffers: &buffers, images: &[], push_constants_size: 0 });
        assert_eq!(result, Err(CgpuError::BufferOffsetNotAligned { offset: 4, alignment: 16 }));

        ctx.destroy_shader(shader).unwrap();
        ctx.destroy_buffer(buffer).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_invalid_spirv_is_rejected() {
        let (mut ctx, device) = setup();
        assert_eq!(ctx.create_shader(device, &[1, 2, 3, 4]), Err(CgpuError::UnableToCreateShaderModule));
        assert_eq!(ctx.live_object_count(), 1);
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_timestamps() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 32);
        let cmd = ctx.create_command_buffer(device).unwrap();
        let fence = ctx.create_fence(device).unwrap();

        ctx.begin_command_buffer(cmd).unwrap();
        ctx.cmd_reset_timestamps(cmd, 0, 4).unwrap();
        ctx.cmd_write_timestamp(cmd, 0).unwrap();
        ctx.cmd_write_timestamp(cmd, 1).unwrap();
        assert_eq!(ctx.cmd_write_timestamp(cmd, 32), Err(CgpuError::MaxTimestampQueryIndexReached(32)));
        assert_eq!(ctx.cmd_copy_timestamps(cmd, buffer, 30, 4, true), Err(CgpuError::MaxTimestampQueryIndexReached(34)));
        ctx.cmd_copy_timestamps(cmd, buffer, 0, 3, true).unwrap();
        ctx.end_command_buffer(cmd).unwrap();
        ctx.reset_fence(fence).unwrap();
        ctx.submit_command_buffer(cmd, fence).unwrap();
        ctx.wait_for_fence(fence).unwrap();

        let bytes = ctx.buffer_native(buffer).unwrap().contents();
        let ticks: Vec<u64> =
            bytes.chunks_exact(8).take(3).map(|c| u64::from_ne_bytes(c.try_into().unwrap())).collect();
        assert!(ticks[1] > ticks[0]);
        assert_eq!(ticks[2], 0);

        ctx.destroy_fence(fence).unwrap();
        ctx.destroy_command_buffer(cmd).unwrap();
        ctx.destroy_buffer(buffer).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_destroy_device_with_live_children_fails() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 16);
        assert_eq!(ctx.destroy_device(device), Err(CgpuError::ResourcesStillAlive(1)));
        ctx.destroy_buffer(buffer).unwrap();
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_stale_handle_after_destroy() {
        let (mut ctx, device) = setup();
        let buffer = host_buffer(&mut ctx, device, 16);
        ctx.destroy_buffer(buffer).unwrap();
        assert_eq!(ctx.buffer_size(buffer), Err(CgpuError::InvalidHandle));
        assert_eq!(ctx.destroy_buffer(buffer), Err(CgpuError::InvalidHandle));
        ctx.destroy_device(device).unwrap();
        ctx.terminate().unwrap();
    }

    #[test]
    fn test_terminate_reports_leaks_in_strict_mode() {
        let (mut ctx, device) = setup();
        host_buffer(&mut ctx, device, 16);
        assert_eq!(ctx.terminate(), Err(CgpuError::ResourcesStillAlive(2)));

        let config = CgpuConfig { resolve_mode: ResolveMode::Unchecked, ..Default::default() };
        let mut ctx = CgpuContext::initialize(EmulatedBackend::default(), config);
        let device = ctx.create_device(0).unwrap();
        host_buffer(&mut ctx, device, 16);
        assert_eq!(ctx.terminate(), Ok(()));
    }

    #[test]
    fn test_device_creation_failures() {
        let config = CgpuConfig { required_device_extensions: vec!["VK_KHR_shader_clock".to_string()], ..Default::default() };
        let mut ctx = CgpuContext::initialize(EmulatedBackend::default(), config);
        assert_eq!(ctx.device_count(), Ok(1));
        assert_eq!(ctx.create_device(3), Err(CgpuError::NoDeviceAtIndex(3)));
        assert_eq!(
            ctx.create_device(0),
            Err(CgpuError::DeviceExtensionNotSupported("VK_KHR_shader_clock".to_string()))
        );
        assert_eq!(ctx.live_object_count(), 0);
        ctx.terminate().unwrap();
    }
}
