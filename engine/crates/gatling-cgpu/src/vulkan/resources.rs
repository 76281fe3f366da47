use std::ptr::NonNull;

use ash::vk;

use crate::basic::desc::{BufferDesc, ImageDesc};
use crate::basic::flags::{AccessFlags, BufferUsage, ImageUsage, MemoryProperties};
use crate::basic::format::ImageFormat;
use crate::error::{CgpuError, CgpuResult};
use crate::foundation::memory::find_memory_type_index;
use crate::vulkan::device::VulkanDevice;

pub struct VulkanBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) allocation_size: u64,
    pub(crate) size: u64,
    pub(crate) properties: MemoryProperties,
    pub(crate) mapped: Option<NonNull<u8>>,
}

pub struct VulkanImage {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) desc: ImageDesc,
    /// 当前 layout 与最后一次访问，用于首次使用时的 layout 转换
    pub(crate) layout: vk::ImageLayout,
    pub(crate) access: vk::AccessFlags,
    pub(crate) mapped: Option<NonNull<u8>>,
}

// 格式与标志转换
pub(crate) fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::R8Unorm => vk::Format::R8_UNORM,
        ImageFormat::R8G8Unorm => vk::Format::R8G8_UNORM,
        ImageFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        ImageFormat::R32Sfloat => vk::Format::R32_SFLOAT,
        ImageFormat::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
        ImageFormat::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::UNIFORM_TEXEL, vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER),
        (BufferUsage::STORAGE_TEXEL, vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

fn vk_image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(crate) fn vk_access_flags(access: AccessFlags) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    for (ours, theirs) in [
        (AccessFlags::UNIFORM_READ, vk::AccessFlags::UNIFORM_READ),
        (AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_READ),
        (AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_WRITE),
        (AccessFlags::TRANSFER_READ, vk::AccessFlags::TRANSFER_READ),
        (AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_WRITE),
        (AccessFlags::HOST_READ, vk::AccessFlags::HOST_READ),
        (AccessFlags::HOST_WRITE, vk::AccessFlags::HOST_WRITE),
        (AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
        (AccessFlags::MEMORY_WRITE, vk::AccessFlags::MEMORY_WRITE),
    ] {
        if access.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

fn allocate_memory(
    device: &VulkanDevice,
    requirements: &vk::MemoryRequirements,
    required: MemoryProperties,
) -> CgpuResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type_index(&device.memory_types, requirements.memory_type_bits, required)?;
    let allocate_info =
        vk::MemoryAllocateInfo::default().allocation_size(requirements.size).memory_type_index(memory_type_index);
    unsafe { device.device.allocate_memory(&allocate_info, None) }.map_err(|e| {
        log::error!("vkAllocateMemory failed ({} bytes): {:?}", requirements.size, e);
        CgpuError::UnableToAllocateMemory
    })
}

/// 把 [offset, offset + size) 扩展到 nonCoherentAtomSize 对齐的范围
fn atom_aligned_range(offset: u64, size: u64, atom: u64, allocation_size: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let begin = offset / atom * atom;
    let end = (offset + size).div_ceil(atom) * atom;
    if end >= allocation_size {
        (begin, vk::WHOLE_SIZE)
    } else {
        (begin, end - begin)
    }
}

// buffer
impl VulkanBuffer {
    pub fn new(device: &VulkanDevice, desc: &BufferDesc) -> CgpuResult<Self> {
        let _span = tracy_client::span!("VulkanBuffer::new");
        let dev = &device.device;

        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { dev.create_buffer(&create_info, None) }.map_err(|_| CgpuError::UnableToCreateBuffer)?;
        let buffer = scopeguard::guard(buffer, |buffer| unsafe { dev.destroy_buffer(buffer, None) });

        let requirements = unsafe { dev.get_buffer_memory_requirements(*buffer) };
        let memory = allocate_memory(device, &requirements, desc.memory_properties)?;
        let memory = scopeguard::guard(memory, |memory| unsafe { dev.free_memory(memory, None) });

        unsafe { dev.bind_buffer_memory(*buffer, *memory, 0) }.map_err(|_| CgpuError::UnableToAllocateMemory)?;

        Ok(Self {
            memory: scopeguard::ScopeGuard::into_inner(memory),
            buffer: scopeguard::ScopeGuard::into_inner(buffer),
            allocation_size: requirements.size,
            size: desc.size,
            properties: desc.memory_properties,
            mapped: None,
        })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            if self.mapped.is_some() {
                device.device.unmap_memory(self.memory);
            }
            device.device.destroy_buffer(self.buffer, None);
            device.device.free_memory(self.memory, None);
        }
    }

    pub fn map(&mut self, device: &VulkanDevice) -> CgpuResult<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        let ptr = unsafe { device.device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(|_| CgpuError::UnableToMapMemory)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(CgpuError::UnableToMapMemory)?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap(&mut self, device: &VulkanDevice) {
        if self.mapped.take().is_some() {
            unsafe { device.device.unmap_memory(self.memory) };
        }
    }

    pub fn flush(&self, device: &VulkanDevice, offset: u64, size: u64) -> CgpuResult<()> {
        if self.properties.contains(MemoryProperties::HOST_COHERENT) {
            return Ok(());
        }
        let (offset, size) =
            atom_aligned_range(offset, size, device.limits.non_coherent_atom_size, self.allocation_size);
        let range = vk::MappedMemoryRange::default().memory(self.memory).offset(offset).size(size);
        unsafe { device.device.flush_mapped_memory_ranges(std::slice::from_ref(&range)) }
            .map_err(|_| CgpuError::UnableToFlushMemory)
    }

    pub fn invalidate(&self, device: &VulkanDevice, offset: u64, size: u64) -> CgpuResult<()> {
        if self.properties.contains(MemoryProperties::HOST_COHERENT) {
            return Ok(());
        }
        let (offset, size) =
            atom_aligned_range(offset, size, device.limits.non_coherent_atom_size, self.allocation_size);
        let range = vk::MappedMemoryRange::default().memory(self.memory).offset(offset).size(size);
        unsafe { device.device.invalidate_mapped_memory_ranges(std::slice::from_ref(&range)) }
            .map_err(|_| CgpuError::UnableToInvalidateMemory)
    }
}

// image
impl VulkanImage {
    pub fn new(device: &VulkanDevice, desc: &ImageDesc) -> CgpuResult<Self> {
        let _span = tracy_client::span!("VulkanImage::new");
        let dev = &device.device;

        // 只做传输的 2D image 使用 linear tiling，便于主机直接映射
        let transfer_only = !desc.usage.intersects(ImageUsage::SAMPLED | ImageUsage::STORAGE);
        let tiling = if !desc.is_3d && transfer_only { vk::ImageTiling::LINEAR } else { vk::ImageTiling::OPTIMAL };
        let format = vk_format(desc.format);

        let create_info = vk::ImageCreateInfo::default()
            .image_type(if desc.is_3d { vk::ImageType::TYPE_3D } else { vk::ImageType::TYPE_2D })
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth.max(1),
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(vk_image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { dev.create_image(&create_info, None) }.map_err(|_| CgpuError::UnableToCreateImage)?;
        let image = scopeguard::guard(image, |image| unsafe { dev.destroy_image(image, None) });

        let requirements = unsafe { dev.get_image_memory_requirements(*image) };
        let memory = allocate_memory(device, &requirements, desc.memory_properties)?;
        let memory = scopeguard::guard(memory, |memory| unsafe { dev.free_memory(memory, None) });

        unsafe { dev.bind_image_memory(*image, *memory, 0) }.map_err(|_| CgpuError::UnableToAllocateMemory)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(*image)
            .view_type(if desc.is_3d { vk::ImageViewType::TYPE_3D } else { vk::ImageViewType::TYPE_2D })
            .format(format)
            .subresource_range(color_subresource_range());
        let view = unsafe { dev.create_image_view(&view_info, None) }.map_err(|_| CgpuError::UnableToCreateImage)?;

        Ok(Self {
            memory: scopeguard::ScopeGuard::into_inner(memory),
            image: scopeguard::ScopeGuard::into_inner(image),
            view,
            desc: *desc,
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
            mapped: None,
        })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            if self.mapped.is_some() {
                device.device.unmap_memory(self.memory);
            }
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
            device.device.free_memory(self.memory, None);
        }
    }

    pub fn map(&mut self, device: &VulkanDevice) -> CgpuResult<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        let ptr = unsafe { device.device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(|_| CgpuError::UnableToMapMemory)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(CgpuError::UnableToMapMemory)?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap(&mut self, device: &VulkanDevice) {
        if self.mapped.take().is_some() {
            unsafe { device.device.unmap_memory(self.memory) };
        }
    }
}

#[inline]
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_aligned_range() {
        assert_eq!(atom_aligned_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(atom_aligned_range(0, 128, 64, 1024), (0, 128));
        assert_eq!(atom_aligned_range(1000, 24, 64, 1024), (960, vk::WHOLE_SIZE));
    }

    #[test]
    fn test_flag_conversion() {
        assert_eq!(
            vk_access_flags(AccessFlags::SHADER_WRITE | AccessFlags::TRANSFER_READ),
            vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(
            vk_buffer_usage(BufferUsage::STORAGE | BufferUsage::TRANSFER_DST),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(vk_format(ImageFormat::R32Sfloat), vk::Format::R32_SFLOAT);
    }
}
