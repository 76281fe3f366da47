use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagerKind {
    /// 两半交替写入，flush 之后无需等待 GPU 即可继续写
    #[default]
    DoubleBuffered,
    /// 单块 buffer，flush 同步等待 GPU 完成
    Synchronous,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    pub kind: StagerKind,
    /// staging buffer 的总大小，双缓冲时每一半各占一半
    pub buffer_size: u64,
    /// 不超过该大小的上传直接写进命令流，实际上限还受设备 max_buffer_update_size 约束
    pub inline_update_threshold: u64,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            kind: StagerKind::DoubleBuffered,
            buffer_size: 64 * 1024 * 1024,
            inline_update_threshold: 65535,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// 主机端保留一份副本，commit 时把脏区间通过 stager 上传到 device local buffer
    #[default]
    OptimalStaging,
    /// 直接写入持久映射的 host visible buffer，commit 时只 flush 脏区间
    PersistentMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    /// 首次增长时至少容纳的元素个数
    pub min_capacity: u64,
    pub update_strategy: UpdateStrategy,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            min_capacity: 64,
            update_strategy: UpdateStrategy::OptimalStaging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stager_config_from_toml() {
        let config: StagerConfig = toml::from_str("kind = \"synchronous\"\nbuffer_size = 1048576").unwrap();
        assert_eq!(config.kind, StagerKind::Synchronous);
        assert_eq!(config.buffer_size, 1 << 20);
        assert_eq!(config.inline_update_threshold, 65535);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: DataStoreConfig = toml::from_str("").unwrap();
        assert_eq!(config, DataStoreConfig::default());
        let config: StagerConfig = toml::from_str("").unwrap();
        assert_eq!(config.kind, StagerKind::DoubleBuffered);
    }
}
