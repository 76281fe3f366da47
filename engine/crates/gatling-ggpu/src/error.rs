use gatling_cgpu::CgpuError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GgpuError {
    #[error(transparent)]
    Cgpu(#[from] CgpuError),

    /// image 的一行必须能放进 stager 的一个可写区域
    #[error("image row of {row_size} bytes exceeds staging capacity of {capacity} bytes")]
    RowExceedsStagingCapacity { row_size: u64, capacity: u64 },
    #[error("image extent does not match the image or the source data")]
    InvalidImageExtent,
    #[error("stager has already been freed")]
    StagerNotAllocated,

    #[error("invalid element handle {0:#x}")]
    InvalidElementHandle(u64),
    #[error("element type of {size} bytes does not fit element size {element_size}")]
    ElementTypeTooLarge { size: u64, element_size: u64 },
    #[error("range [{offset}, +{size}) out of bounds, capacity {capacity}")]
    RangeOutOfBounds { offset: u64, size: u64, capacity: u64 },
    #[error("allocation of {size} bytes exceeds capacity of {capacity} bytes")]
    AllocationTooLarge { size: u64, capacity: u64 },
}

pub type GgpuResult<T> = Result<T, GgpuError>;
