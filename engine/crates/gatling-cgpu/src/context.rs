//! 扁平的 GPU API
//!
//! 所有可变状态都在 `CgpuContext` 中：后端实例加上每类资源一张对象表。
//! 调用方只持有 handle；每个 create 先分配 handle 再创建后端资源，失败时归还 handle。
//! context 不做任何同步，多线程使用需要调用方自行加锁。

use std::ptr::NonNull;

use serde::Deserialize;

use crate::backend::GpuBackend;
use crate::basic::desc::{
    BufferBinding, BufferDesc, BufferImageCopyDesc, BufferMemoryBarrier, ImageBinding, ImageDesc, MemoryBarrier,
    PipelineDesc, ResolvedBufferBarrier, ShaderResourceBuffer, ShaderResourceImage,
};
use crate::basic::flags::WHOLE_SIZE;
use crate::basic::limits::DeviceLimits;
use crate::error::{CgpuError, CgpuResult};
use crate::handle::object_table::{ObjectTable, ResolveMode};
use crate::handle::typed::{
    BufferHandle, CommandBufferHandle, DeviceHandle, FenceHandle, ImageHandle, PipelineHandle, ShaderHandle,
};

/// 每个设备的 timestamp query pool 大小
pub const MAX_TIMESTAMP_QUERIES: u32 = 32;

/// 创建后端实例时使用的应用信息
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub name: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: "gatling".to_string(),
            version_major: 0,
            version_minor: 1,
            version_patch: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CgpuConfig {
    pub resolve_mode: ResolveMode,
    /// 设备必须支持的扩展名
    pub required_device_extensions: Vec<String>,
    /// 在外部枚举得到的物理设备列表中的下标
    pub device_index: u32,
}

struct DeviceRecord<D> {
    native: D,
    limits: DeviceLimits,
}

struct BufferRecord<T> {
    native: T,
    device: DeviceHandle,
    size: u64,
    mapped: Option<NonNull<u8>>,
}

struct ImageRecord<T> {
    native: T,
    device: DeviceHandle,
    desc: ImageDesc,
    mapped: Option<NonNull<u8>>,
}

struct PipelineRecord<T> {
    native: T,
    device: DeviceHandle,
    push_constants_size: u32,
}

/// 只需要记录所属设备的对象：shader、command buffer、fence
struct DeviceChild<T> {
    native: T,
    device: DeviceHandle,
}

pub struct CgpuContext<B: GpuBackend> {
    backend: B,
    config: CgpuConfig,

    devices: ObjectTable<DeviceRecord<B::Device>>,
    buffers: ObjectTable<BufferRecord<B::Buffer>>,
    images: ObjectTable<ImageRecord<B::Image>>,
    shaders: ObjectTable<DeviceChild<B::Shader>>,
    pipelines: ObjectTable<PipelineRecord<B::Pipeline>>,
    command_buffers: ObjectTable<DeviceChild<B::CommandBuffer>>,
    fences: ObjectTable<DeviceChild<B::Fence>>,

    destroyed: bool,
}

// 创建与销毁
impl<B: GpuBackend> CgpuContext<B> {
    pub fn initialize(backend: B, config: CgpuConfig) -> Self {
        log::info!("cgpu initialized with {} backend, resolve mode: {:?}", backend.name(), config.resolve_mode);

        let mode = config.resolve_mode;
        Self {
            backend,
            config,
            devices: ObjectTable::new(mode),
            buffers: ObjectTable::new(mode),
            images: ObjectTable::new(mode),
            shaders: ObjectTable::new(mode),
            pipelines: ObjectTable::new(mode),
            command_buffers: ObjectTable::new(mode),
            fences: ObjectTable::new(mode),
            destroyed: false,
        }
    }

    /// 销毁后端实例
    ///
    /// 仍然存活的对象会按依赖的逆序销毁并打印警告；strict 模式下随后返回 `ResourcesStillAlive`。
    pub fn terminate(mut self) -> CgpuResult<()> {
        let _span = tracy_client::span!("CgpuContext::terminate");

        let leaked = self.live_object_count();
        if leaked > 0 {
            log::warn!("cgpu terminate: destroying {} leaked objects", leaked);
            self.destroy_leaked_objects();
        }

        self.backend.destroy_instance();
        self.destroyed = true;
        log::info!("cgpu terminated");

        if leaked > 0 && self.config.resolve_mode == ResolveMode::Strict {
            return Err(CgpuError::ResourcesStillAlive(leaked));
        }
        Ok(())
    }

    fn destroy_leaked_objects(&mut self) {
        for handle in self.fences.handles() {
            if let Ok(record) = self.fences.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    self.backend.destroy_fence(&device.native, record.native);
                }
            }
        }
        for handle in self.command_buffers.handles() {
            if let Ok(record) = self.command_buffers.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    self.backend.destroy_command_buffer(&device.native, record.native);
                }
            }
        }
        for handle in self.pipelines.handles() {
            if let Ok(record) = self.pipelines.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    self.backend.destroy_pipeline(&device.native, record.native);
                }
            }
        }
        for handle in self.shaders.handles() {
            if let Ok(record) = self.shaders.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    self.backend.destroy_shader(&device.native, record.native);
                }
            }
        }
        for handle in self.images.handles() {
            if let Ok(mut record) = self.images.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    if record.mapped.take().is_some() {
                        self.backend.unmap_image(&device.native, &mut record.native);
                    }
                    self.backend.destroy_image(&device.native, record.native);
                }
            }
        }
        for handle in self.buffers.handles() {
            if let Ok(mut record) = self.buffers.remove(handle) {
                if let Ok(device) = self.devices.resolve(record.device.0) {
                    if record.mapped.take().is_some() {
                        self.backend.unmap_buffer(&device.native, &mut record.native);
                    }
                    self.backend.destroy_buffer(&device.native, record.native);
                }
            }
        }
        for handle in self.devices.handles() {
            if let Ok(record) = self.devices.remove(handle) {
                self.backend.destroy_device(record.native);
            }
        }
    }
}

impl<B: GpuBackend> Drop for CgpuContext<B> {
    fn drop(&mut self) {
        debug_assert!(self.destroyed, "CgpuContext must be terminated before being dropped.");
    }
}

// getters
impl<B: GpuBackend> CgpuContext<B> {
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &CgpuConfig {
        &self.config
    }

    /// 所有对象表中存活对象的总数
    pub fn live_object_count(&self) -> usize {
        self.devices.len()
            + self.buffers.len()
            + self.images.len()
            + self.shaders.len()
            + self.pipelines.len()
            + self.command_buffers.len()
            + self.fences.len()
    }

    /// 后端原生对象，只用于调试与测试中的检查
    pub fn buffer_native(&self, buffer: BufferHandle) -> CgpuResult<&B::Buffer> {
        self.buffers.resolve(buffer.0).map(|record| &record.native)
    }

    pub fn image_native(&self, image: ImageHandle) -> CgpuResult<&B::Image> {
        self.images.resolve(image.0).map(|record| &record.native)
    }

    pub fn pipeline_native(&self, pipeline: PipelineHandle) -> CgpuResult<&B::Pipeline> {
        self.pipelines.resolve(pipeline.0).map(|record| &record.native)
    }

    #[inline]
    fn device_native(
        devices: &ObjectTable<DeviceRecord<B::Device>>,
        device: DeviceHandle,
    ) -> CgpuResult<&B::Device> {
        devices.resolve(device.0).map(|record| &record.native)
    }
}

// 设备
impl<B: GpuBackend> CgpuContext<B> {
    pub fn device_count(&self) -> CgpuResult<u32> {
        self.backend.physical_device_count()
    }

    /// 使用配置中的必需扩展创建逻辑设备
    pub fn create_device(&mut self, index: u32) -> CgpuResult<DeviceHandle> {
        let _span = tracy_client::span!("CgpuContext::create_device");

        let extensions = &self.config.required_device_extensions;
        let backend = &self.backend;
        let handle = self.devices.insert_with(|_| {
            let native = backend.create_device(index, extensions)?;
            let limits = backend.device_limits(&native);
            Ok(DeviceRecord { native, limits })
        })?;
        Ok(DeviceHandle(handle))
    }

    /// 设备上的所有资源必须先于设备销毁
    pub fn destroy_device(&mut self, device: DeviceHandle) -> CgpuResult<()> {
        self.devices.resolve(device.0)?;

        let children = self.buffers.iter().filter(|(_, r)| r.device == device).count()
            + self.images.iter().filter(|(_, r)| r.device == device).count()
            + self.shaders.iter().filter(|(_, r)| r.device == device).count()
            + self.pipelines.iter().filter(|(_, r)| r.device == device).count()
            + self.command_buffers.iter().filter(|(_, r)| r.device == device).count()
            + self.fences.iter().filter(|(_, r)| r.device == device).count();
        if children > 0 {
            log::error!("destroy_device: {} objects still alive on {:?}", children, device);
            return Err(CgpuError::ResourcesStillAlive(children));
        }

        let record = self.devices.remove(device.0)?;
        self.backend.destroy_device(record.native);
        Ok(())
    }

    pub fn device_limits(&self, device: DeviceHandle) -> CgpuResult<DeviceLimits> {
        self.devices.resolve(device.0).map(|record| record.limits)
    }
}

// buffer
impl<B: GpuBackend> CgpuContext<B> {
    pub fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDesc) -> CgpuResult<BufferHandle> {
        let device_native = Self::device_native(&self.devices, device)?;
        if desc.size == 0 {
            return Err(CgpuError::UnableToCreateBuffer);
        }

        let backend = &self.backend;
        let handle = self.buffers.insert_with(|_| {
            let native = backend.create_buffer(device_native, desc)?;
            Ok(BufferRecord {
                native,
                device,
                size: desc.size,
                mapped: None,
            })
        })?;
        log::trace!("buffer {:?} created: {} bytes, {:?}", handle, desc.size, desc.memory_properties);
        Ok(BufferHandle(handle))
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) -> CgpuResult<()> {
        let device_record = self.devices.resolve(self.buffers.resolve(buffer.0)?.device.0)?;
        let mut record = self.buffers.remove(buffer.0)?;
        if record.mapped.take().is_some() {
            self.backend.unmap_buffer(&device_record.native, &mut record.native);
        }
        self.backend.destroy_buffer(&device_record.native, record.native);
        log::trace!("buffer {:?} destroyed", buffer);
        Ok(())
    }

    /// 重复 map 返回同一个指针
    pub fn map_buffer(&mut self, buffer: BufferHandle) -> CgpuResult<NonNull<u8>> {
        let record = self.buffers.resolve_mut(buffer.0)?;
        if let Some(ptr) = record.mapped {
            return Ok(ptr);
        }
        let device = Self::device_native(&self.devices, record.device)?;
        let ptr = self.backend.map_buffer(device, &mut record.native)?;
        record.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap_buffer(&mut self, buffer: BufferHandle) -> CgpuResult<()> {
        let record = self.buffers.resolve_mut(buffer.0)?;
        if record.mapped.take().is_some() {
            let device = Self::device_native(&self.devices, record.device)?;
            self.backend.unmap_buffer(device, &mut record.native);
        }
        Ok(())
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> CgpuResult<u64> {
        self.buffers.resolve(buffer.0).map(|record| record.size)
    }

    /// 把主机写入的范围刷新到设备可见，`size` 可以是 `WHOLE_SIZE`
    pub fn flush_mapped_memory(&self, buffer: BufferHandle, offset: u64, size: u64) -> CgpuResult<()> {
        let record = self.buffers.resolve(buffer.0)?;
        let size = Self::resolve_range(record.size, offset, size)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.flush_mapped_memory(device, &record.native, offset, size)
    }

    /// 让设备写入的范围对主机可见，`size` 可以是 `WHOLE_SIZE`
    pub fn invalidate_mapped_memory(&self, buffer: BufferHandle, offset: u64, size: u64) -> CgpuResult<()> {
        let record = self.buffers.resolve(buffer.0)?;
        let size = Self::resolve_range(record.size, offset, size)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.invalidate_mapped_memory(device, &record.native, offset, size)
    }

    fn resolve_range(total: u64, offset: u64, size: u64) -> CgpuResult<u64> {
        if offset > total {
            return Err(CgpuError::CopyRegionOutOfBounds);
        }
        let size = if size == WHOLE_SIZE { total - offset } else { size };
        match offset.checked_add(size) {
            Some(end) if end <= total => Ok(size),
            _ => Err(CgpuError::CopyRegionOutOfBounds),
        }
    }
}

// image
impl<B: GpuBackend> CgpuContext<B> {
    pub fn create_image(&mut self, device: DeviceHandle, desc: &ImageDesc) -> CgpuResult<ImageHandle> {
        let device_record = self.devices.resolve(device.0)?;
        let max_dim = if desc.is_3d { device_record.limits.max_image_dimension_3d } else { device_record.limits.max_image_dimension_2d };
        if desc.width == 0
            || desc.height == 0
            || desc.depth == 0
            || (!desc.is_3d && desc.depth != 1)
            || desc.width.max(desc.height).max(desc.depth) > max_dim
        {
            return Err(CgpuError::UnableToCreateImage);
        }

        let backend = &self.backend;
        let handle = self.images.insert_with(|_| {
            let native = backend.create_image(&device_record.native, desc)?;
            Ok(ImageRecord {
                native,
                device,
                desc: *desc,
                mapped: None,
            })
        })?;
        log::trace!("image {:?} created: {}x{}x{} {:?}", handle, desc.width, desc.height, desc.depth, desc.format);
        Ok(ImageHandle(handle))
    }

    pub fn destroy_image(&mut self, image: ImageHandle) -> CgpuResult<()> {
        let device_record = self.devices.resolve(self.images.resolve(image.0)?.device.0)?;
        let mut record = self.images.remove(image.0)?;
        if record.mapped.take().is_some() {
            self.backend.unmap_image(&device_record.native, &mut record.native);
        }
        self.backend.destroy_image(&device_record.native, record.native);
        log::trace!("image {:?} destroyed", image);
        Ok(())
    }

    pub fn map_image(&mut self, image: ImageHandle) -> CgpuResult<NonNull<u8>> {
        let record = self.images.resolve_mut(image.0)?;
        if let Some(ptr) = record.mapped {
            return Ok(ptr);
        }
        let device = Self::device_native(&self.devices, record.device)?;
        let ptr = self.backend.map_image(device, &mut record.native)?;
        record.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap_image(&mut self, image: ImageHandle) -> CgpuResult<()> {
        let record = self.images.resolve_mut(image.0)?;
        if record.mapped.take().is_some() {
            let device = Self::device_native(&self.devices, record.device)?;
            self.backend.unmap_image(device, &mut record.native);
        }
        Ok(())
    }

    pub fn image_desc(&self, image: ImageHandle) -> CgpuResult<ImageDesc> {
        self.images.resolve(image.0).map(|record| record.desc)
    }
}

// shader 与 pipeline
impl<B: GpuBackend> CgpuContext<B> {
    pub fn create_shader(&mut self, device: DeviceHandle, spirv: &[u8]) -> CgpuResult<ShaderHandle> {
        let device_native = Self::device_native(&self.devices, device)?;
        let backend = &self.backend;
        let handle = self.shaders.insert_with(|_| {
            let native = backend.create_shader(device_native, spirv)?;
            Ok(DeviceChild { native, device })
        })?;
        Ok(ShaderHandle(handle))
    }

    pub fn destroy_shader(&mut self, shader: ShaderHandle) -> CgpuResult<()> {
        let device = Self::device_native(&self.devices, self.shaders.resolve(shader.0)?.device)?;
        let record = self.shaders.remove(shader.0)?;
        self.backend.destroy_shader(device, record.native);
        Ok(())
    }

    /// 创建 compute pipeline
    ///
    /// descriptor set layout 由声明的 buffer/image 资源得到，只有 shader 会写入的资源在创建时写入 descriptor，
    /// 只读资源需要通过 `update_pipeline_bindings` 绑定。
    pub fn create_pipeline(&mut self, device: DeviceHandle, desc: &PipelineDesc<'_>) -> CgpuResult<PipelineHandle> {
        let _span = tracy_client::span!("CgpuContext::create_pipeline");

        let device_record = self.devices.resolve(device.0)?;
        if desc.push_constants_size > device_record.limits.max_push_constants_size {
            return Err(CgpuError::PushConstantsTooLarge {
                size: desc.push_constants_size as u64,
                max: device_record.limits.max_push_constants_size as u64,
            });
        }
        let shader = &self.shaders.resolve(desc.shader.0)?.native;
        let buffers = Self::resolve_buffer_bindings(&self.buffers, &device_record.limits, desc.buffers)?;
        let images = Self::resolve_image_bindings(&self.images, desc.images)?;

        let backend = &self.backend;
        let push_constants_size = desc.push_constants_size;
        let handle = self.pipelines.insert_with(|_| {
            let native = backend.create_pipeline(&device_record.native, shader, &buffers, &images, push_constants_size)?;
            Ok(PipelineRecord {
                native,
                device,
                push_constants_size,
            })
        })?;
        Ok(PipelineHandle(handle))
    }

    /// 重新写入 pipeline 的 descriptor，绑定编号必须在创建时声明过
    pub fn update_pipeline_bindings(
        &mut self,
        pipeline: PipelineHandle,
        buffers: &[ShaderResourceBuffer],
        images: &[ShaderResourceImage],
    ) -> CgpuResult<()> {
        let record = self.pipelines.resolve_mut(pipeline.0)?;
        let device_record = self.devices.resolve(record.device.0)?;
        let buffers = Self::resolve_buffer_bindings(&self.buffers, &device_record.limits, buffers)?;
        let images = Self::resolve_image_bindings(&self.images, images)?;
        self.backend.update_pipeline_bindings(&device_record.native, &mut record.native, &buffers, &images)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> CgpuResult<()> {
        let device = Self::device_native(&self.devices, self.pipelines.resolve(pipeline.0)?.device)?;
        let record = self.pipelines.remove(pipeline.0)?;
        self.backend.destroy_pipeline(device, record.native);
        Ok(())
    }

    fn resolve_buffer_bindings<'a>(
        table: &'a ObjectTable<BufferRecord<B::Buffer>>,
        limits: &DeviceLimits,
        resources: &[ShaderResourceBuffer],
    ) -> CgpuResult<Vec<BufferBinding<'a, B::Buffer>>> {
        resources
            .iter()
            .map(|resource| {
                let record = table.resolve(resource.buffer.0)?;
                let alignment = limits.min_storage_buffer_offset_alignment.max(1);
                if resource.offset % alignment != 0 {
                    return Err(CgpuError::BufferOffsetNotAligned {
                        offset: resource.offset,
                        alignment,
                    });
                }
                let size = Self::resolve_range(record.size, resource.offset, resource.size)?;
                Ok(BufferBinding {
                    binding: resource.binding,
                    native: &record.native,
                    offset: resource.offset,
                    size,
                    access: resource.access,
                })
            })
            .collect()
    }

    fn resolve_image_bindings<'a>(
        table: &'a ObjectTable<ImageRecord<B::Image>>,
        resources: &[ShaderResourceImage],
    ) -> CgpuResult<Vec<ImageBinding<'a, B::Image>>> {
        resources
            .iter()
            .map(|resource| {
                let record = table.resolve(resource.image.0)?;
                Ok(ImageBinding {
                    binding: resource.binding,
                    native: &record.native,
                    access: resource.access,
                })
            })
            .collect()
    }
}

// command buffer
impl<B: GpuBackend> CgpuContext<B> {
    pub fn create_command_buffer(&mut self, device: DeviceHandle) -> CgpuResult<CommandBufferHandle> {
        let device_native = Self::device_native(&self.devices, device)?;
        let backend = &self.backend;
        let handle = self.command_buffers.insert_with(|_| {
            let native = backend.create_command_buffer(device_native)?;
            Ok(DeviceChild { native, device })
        })?;
        Ok(CommandBufferHandle(handle))
    }

    pub fn destroy_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> CgpuResult<()> {
        let device = Self::device_native(&self.devices, self.command_buffers.resolve(command_buffer.0)?.device)?;
        let record = self.command_buffers.remove(command_buffer.0)?;
        self.backend.destroy_command_buffer(device, record.native);
        Ok(())
    }

    pub fn begin_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.begin_command_buffer(device, &mut record.native)
    }

    pub fn end_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.end_command_buffer(device, &mut record.native)
    }
}

// 命令录制
impl<B: GpuBackend> CgpuContext<B> {
    pub fn cmd_bind_pipeline(&mut self, command_buffer: CommandBufferHandle, pipeline: PipelineHandle) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let pipeline = &self.pipelines.resolve(pipeline.0)?.native;
        self.backend.cmd_bind_pipeline(device, &mut record.native, pipeline)
    }

    /// `size` 为 `WHOLE_SIZE` 时拷贝 src_offset 之后的全部内容
    pub fn cmd_copy_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let src_record = self.buffers.resolve(src.0)?;
        let dst_record = self.buffers.resolve(dst.0)?;

        let size = Self::resolve_range(src_record.size, src_offset, size)?;
        Self::resolve_range(dst_record.size, dst_offset, size)?;

        self.backend.cmd_copy_buffer(
            device,
            &mut record.native,
            &src_record.native,
            src_offset,
            &dst_record.native,
            dst_offset,
            size,
        )
    }

    /// 把少量数据直接写进命令流，大小与 offset 必须是 4 的倍数
    pub fn cmd_update_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        data: &[u8],
        dst: BufferHandle,
        dst_offset: u64,
    ) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device_record = self.devices.resolve(record.device.0)?;
        let dst_record = self.buffers.resolve(dst.0)?;

        let size = data.len() as u64;
        let max = device_record.limits.max_buffer_update_size;
        if size == 0 || size > max || size % 4 != 0 || dst_offset % 4 != 0 {
            return Err(CgpuError::InlineUpdateTooLarge { size, max });
        }
        Self::resolve_range(dst_record.size, dst_offset, size)?;

        self.backend.cmd_update_buffer(&device_record.native, &mut record.native, data, &dst_record.native, dst_offset)
    }

    pub fn cmd_copy_buffer_to_image(
        &mut self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        dst: ImageHandle,
        region: &BufferImageCopyDesc,
    ) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let src_record = self.buffers.resolve(src.0)?;
        let dst_record = self.images.resolve_mut(dst.0)?;

        let desc = &dst_record.desc;
        let fits = |offset: u32, extent: u32, limit: u32| extent > 0 && offset as u64 + extent as u64 <= limit as u64;
        if !fits(region.texel_offset_x, region.texel_extent_x, desc.width)
            || !fits(region.texel_offset_y, region.texel_extent_y, desc.height)
            || !fits(region.texel_offset_z, region.texel_extent_z, desc.depth)
        {
            return Err(CgpuError::CopyRegionOutOfBounds);
        }
        let byte_size = region.texel_extent_x as u64
            * region.texel_extent_y as u64
            * region.texel_extent_z as u64
            * desc.format.texel_size();
        Self::resolve_range(src_record.size, region.buffer_offset, byte_size)?;
        // bufferOffset 必须同时是 texel 大小与 4 的倍数，texel 大小都是 2 的幂
        let alignment = desc.format.texel_size().max(4);
        if region.buffer_offset % alignment != 0 {
            log::error!("buffer to image copy offset {} is not aligned to {}", region.buffer_offset, alignment);
            return Err(CgpuError::BufferOffsetNotAligned {
                offset: region.buffer_offset,
                alignment,
            });
        }

        self.backend.cmd_copy_buffer_to_image(device, &mut record.native, &src_record.native, &mut dst_record.native, region)
    }

    pub fn cmd_push_constants(
        &mut self,
        command_buffer: CommandBufferHandle,
        pipeline: PipelineHandle,
        data: &[u8],
    ) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let pipeline_record = self.pipelines.resolve(pipeline.0)?;
        if data.len() as u64 > pipeline_record.push_constants_size as u64 {
            return Err(CgpuError::PushConstantsTooLarge {
                size: data.len() as u64,
                max: pipeline_record.push_constants_size as u64,
            });
        }
        self.backend.cmd_push_constants(device, &mut record.native, &pipeline_record.native, data)
    }

    pub fn cmd_dispatch(&mut self, command_buffer: CommandBufferHandle, x: u32, y: u32, z: u32) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.cmd_dispatch(device, &mut record.native, [x, y, z])
    }

    /// 屏障的两侧都限定在 compute shader 与 transfer 阶段
    pub fn cmd_pipeline_barrier(
        &mut self,
        command_buffer: CommandBufferHandle,
        barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferMemoryBarrier],
    ) -> CgpuResult<()> {
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let buffer_barriers = buffer_barriers
            .iter()
            .map(|barrier| {
                let buffer = self.buffers.resolve(barrier.buffer.0)?;
                let size = Self::resolve_range(buffer.size, barrier.offset, barrier.size)?;
                Ok(ResolvedBufferBarrier {
                    native: &buffer.native,
                    src_access: barrier.src_access,
                    dst_access: barrier.dst_access,
                    offset: barrier.offset,
                    size,
                })
            })
            .collect::<CgpuResult<Vec<_>>>()?;
        self.backend.cmd_pipeline_barrier(device, &mut record.native, barriers, &buffer_barriers)
    }

    pub fn cmd_reset_timestamps(&mut self, command_buffer: CommandBufferHandle, offset: u32, count: u32) -> CgpuResult<()> {
        Self::check_timestamp_range(offset, count)?;
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.cmd_reset_timestamps(device, &mut record.native, offset, count)
    }

    pub fn cmd_write_timestamp(&mut self, command_buffer: CommandBufferHandle, index: u32) -> CgpuResult<()> {
        if index >= MAX_TIMESTAMP_QUERIES {
            return Err(CgpuError::MaxTimestampQueryIndexReached(index));
        }
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.cmd_write_timestamp(device, &mut record.native, index)
    }

    /// 把 `[offset, offset + count)` 的 timestamp 以 u64 写入 buffer 开头
    pub fn cmd_copy_timestamps(
        &mut self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u32,
        count: u32,
        wait_until_available: bool,
    ) -> CgpuResult<()> {
        Self::check_timestamp_range(offset, count)?;
        let record = self.command_buffers.resolve_mut(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let buffer_record = self.buffers.resolve(buffer.0)?;
        Self::resolve_range(buffer_record.size, 0, count as u64 * size_of::<u64>() as u64)?;
        self.backend.cmd_copy_timestamps(device, &mut record.native, &buffer_record.native, offset, count, wait_until_available)
    }

    fn check_timestamp_range(offset: u32, count: u32) -> CgpuResult<()> {
        let end = offset as u64 + count as u64;
        if end > MAX_TIMESTAMP_QUERIES as u64 {
            return Err(CgpuError::MaxTimestampQueryIndexReached(end.min(u32::MAX as u64) as u32));
        }
        Ok(())
    }
}

// fence 与提交
impl<B: GpuBackend> CgpuContext<B> {
    /// 新建的 fence 处于 signaled 状态
    pub fn create_fence(&mut self, device: DeviceHandle) -> CgpuResult<FenceHandle> {
        let device_native = Self::device_native(&self.devices, device)?;
        let backend = &self.backend;
        let handle = self.fences.insert_with(|_| {
            let native = backend.create_fence(device_native)?;
            Ok(DeviceChild { native, device })
        })?;
        Ok(FenceHandle(handle))
    }

    pub fn destroy_fence(&mut self, fence: FenceHandle) -> CgpuResult<()> {
        let device = Self::device_native(&self.devices, self.fences.resolve(fence.0)?.device)?;
        let record = self.fences.remove(fence.0)?;
        self.backend.destroy_fence(device, record.native);
        Ok(())
    }

    pub fn reset_fence(&self, fence: FenceHandle) -> CgpuResult<()> {
        let record = self.fences.resolve(fence.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.reset_fence(device, &record.native)
    }

    /// 阻塞等待 fence，没有超时
    pub fn wait_for_fence(&self, fence: FenceHandle) -> CgpuResult<()> {
        let _span = tracy_client::span!("CgpuContext::wait_for_fence");
        let record = self.fences.resolve(fence.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        self.backend.wait_for_fence(device, &record.native)
    }

    pub fn submit_command_buffer(&self, command_buffer: CommandBufferHandle, fence: FenceHandle) -> CgpuResult<()> {
        let _span = tracy_client::span!("CgpuContext::submit_command_buffer");
        let record = self.command_buffers.resolve(command_buffer.0)?;
        let device = Self::device_native(&self.devices, record.device)?;
        let fence = &self.fences.resolve(fence.0)?.native;
        self.backend.submit_command_buffer(device, &record.native, fence)
    }
}
