/// 创建设备时拍下的物理设备能力快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub max_push_constants_size: u32,
    /// vkCmdUpdateBuffer 单次允许的最大字节数
    pub max_buffer_update_size: u64,
    pub max_storage_buffer_range: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_size: [u32; 3],
    pub max_image_dimension_2d: u32,
    pub max_image_dimension_3d: u32,
    pub subgroup_size: u32,
    /// 一个 timestamp tick 对应的纳秒数
    pub timestamp_period: f32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_storage_buffer_offset_alignment: 16,
            min_uniform_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            max_push_constants_size: 128,
            max_buffer_update_size: 65536,
            max_storage_buffer_range: 1 << 27,
            max_compute_work_group_count: [65535; 3],
            max_compute_work_group_size: [1024, 1024, 64],
            max_image_dimension_2d: 16384,
            max_image_dimension_3d: 2048,
            subgroup_size: 32,
            timestamp_period: 1.0,
        }
    }
}
