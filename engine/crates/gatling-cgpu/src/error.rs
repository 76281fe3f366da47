//! cgpu 的错误类型
//!
//! 每个变体对应扁平 API 的一个失败码，后端相关的细节只体现在日志中。

use thiserror::Error;

/// cgpu 所有操作的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CgpuError {
    #[error("invalid handle")]
    InvalidHandle,

    // 实例与设备
    #[error("unable to initialize vulkan")]
    UnableToInitializeVulkan,
    #[error("no physical device at index {0}")]
    NoDeviceAtIndex(u32),
    #[error("max number of physical devices reached")]
    MaxPhysicalDevicesReached,
    #[error("vulkan version not supported")]
    VkVersionNotSupported,
    #[error("device feature requirements not met")]
    FeatureRequirementsNotMet,
    #[error("device extension not supported: {0}")]
    DeviceExtensionNotSupported(String),
    #[error("no compute queue family")]
    NoComputeQueueFamily,
    #[error("can not create logical device")]
    CanNotCreateLogicalDevice,
    #[error("can not create command pool")]
    CanNotCreateCommandPool,
    #[error("unable to create query pool")]
    UnableToCreateQueryPool,
    #[error("unable to create sampler")]
    UnableToCreateSampler,

    // 资源
    #[error("unable to create shader module")]
    UnableToCreateShaderModule,
    #[error("unable to create buffer")]
    UnableToCreateBuffer,
    #[error("unable to create image")]
    UnableToCreateImage,
    #[error("no suitable memory type")]
    NoSuitableMemoryType,
    #[error("unable to allocate memory")]
    UnableToAllocateMemory,
    #[error("unable to map memory")]
    UnableToMapMemory,
    #[error("unable to flush mapped memory")]
    UnableToFlushMemory,
    #[error("unable to invalidate mapped memory")]
    UnableToInvalidateMemory,

    // pipeline
    #[error("unable to create descriptor set layout")]
    UnableToCreateDescriptorLayout,
    #[error("unable to create pipeline layout")]
    UnableToCreatePipelineLayout,
    #[error("unable to create compute pipeline")]
    UnableToCreateComputePipeline,
    #[error("unable to create descriptor pool")]
    UnableToCreateDescriptorPool,
    #[error("unable to allocate descriptor set")]
    UnableToAllocateDescriptorSet,
    #[error("buffer offset {offset} is not aligned to {alignment}")]
    BufferOffsetNotAligned { offset: u64, alignment: u64 },

    // command buffer 与同步
    #[error("unable to allocate command buffer")]
    UnableToAllocateCommandBuffer,
    #[error("unable to begin command buffer")]
    UnableToBeginCommandBuffer,
    #[error("command buffer is not in the recording state")]
    CommandBufferNotRecording,
    #[error("unable to end command buffer")]
    UnableToEndCommandBuffer,
    #[error("unable to create fence")]
    UnableToCreateFence,
    #[error("unable to reset fence")]
    UnableToResetFence,
    #[error("unable to wait for fence")]
    UnableToWaitForFence,
    #[error("unable to submit command buffer")]
    UnableToSubmitCommandBuffer,
    #[error("timestamp query index {0} exceeds the query pool")]
    MaxTimestampQueryIndexReached(u32),
    #[error("push constants of {size} bytes exceed the declared range of {max} bytes")]
    PushConstantsTooLarge { size: u64, max: u64 },
    #[error("inline buffer update of {size} bytes is not allowed (max {max}, 4-byte aligned)")]
    InlineUpdateTooLarge { size: u64, max: u64 },
    #[error("copy region out of bounds")]
    CopyRegionOutOfBounds,

    // 生命周期
    #[error("{0} objects were still alive at terminate")]
    ResourcesStillAlive(usize),
}

pub type CgpuResult<T> = Result<T, CgpuError>;
