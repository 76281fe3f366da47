use crate::basic::flags::MemoryProperties;
use crate::error::{CgpuError, CgpuResult};

/// 在后端报告的内存类型列表中做 first-fit 扫描
///
/// * `type_bits` - 资源的 memoryTypeBits，第 i 位表示允许使用第 i 个内存类型
/// * `required` - 内存类型必须同时具备的全部属性
pub fn find_memory_type_index(
    memory_types: &[MemoryProperties],
    type_bits: u32,
    required: MemoryProperties,
) -> CgpuResult<u32> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, properties)| (type_bits & (1 << i)) != 0 && properties.contains(required))
        .map(|(i, _)| i as u32)
        .ok_or(CgpuError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop_types() -> Vec<MemoryProperties> {
        vec![
            MemoryProperties::DEVICE_LOCAL,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT | MemoryProperties::HOST_CACHED,
        ]
    }

    #[test]
    fn test_first_fit() {
        let types = desktop_types();
        assert_eq!(find_memory_type_index(&types, !0, MemoryProperties::HOST_VISIBLE), Ok(1));
        assert_eq!(find_memory_type_index(&types, !0, MemoryProperties::HOST_CACHED), Ok(2));
        assert_eq!(find_memory_type_index(&types, !0, MemoryProperties::empty()), Ok(0));
    }

    #[test]
    fn test_type_bits_filter() {
        let types = desktop_types();
        assert_eq!(find_memory_type_index(&types, 0b100, MemoryProperties::HOST_VISIBLE), Ok(2));
        assert_eq!(
            find_memory_type_index(&types, 0b001, MemoryProperties::HOST_VISIBLE),
            Err(CgpuError::NoSuitableMemoryType)
        );
    }

    #[test]
    fn test_all_bits_required() {
        let types = desktop_types();
        assert_eq!(
            find_memory_type_index(&types, !0, MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE),
            Err(CgpuError::NoSuitableMemoryType)
        );
    }
}
