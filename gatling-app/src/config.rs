use std::path::PathBuf;

use gatling_cgpu::{AppInfo, CgpuConfig};
use gatling_ggpu::StagerConfig;
use serde::Deserialize;

/// `gatling.toml` 的全部内容，每个字段都有默认值
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatlingConfig {
    pub app: AppInfo,
    pub log: LogConfig,
    pub cgpu: CgpuConfig,
    pub stager: StagerConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// 无法识别的级别按 info 处理
    pub fn level_filter(&self) -> log::LevelFilter {
        gatling_crate_tools::init_log::parse_level(&self.level).unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 校验用的 pattern buffer 大小
    pub pattern_size: u64,
    /// 纹理路径，相对路径基于 asset_root
    pub textures: Vec<PathBuf>,
    pub asset_root: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pattern_size: 16 * 1024 * 1024,
            textures: vec![],
            asset_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatling_cgpu::ResolveMode;
    use gatling_ggpu::StagerKind;

    #[test]
    fn test_empty_config_is_valid() {
        let config: GatlingConfig = toml::from_str("").unwrap();
        assert_eq!(config.app.name, "gatling");
        assert_eq!(config.log.level_filter(), log::LevelFilter::Info);
        assert_eq!(config.cgpu.resolve_mode, ResolveMode::Strict);
        assert_eq!(config.stager.kind, StagerKind::DoubleBuffered);
        assert_eq!(config.upload.pattern_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_full_config() {
        let config: GatlingConfig = toml::from_str(
            r#"
            [app]
            name = "upload-test"
            version_major = 1

            [log]
            level = "debug"

            [cgpu]
            resolve_mode = "unchecked"
            device_index = 1
            required_device_extensions = ["VK_KHR_shader_non_semantic_info"]

            [stager]
            kind = "synchronous"
            buffer_size = 4096

            [upload]
            pattern_size = 1000
            textures = ["a.png", "b.png"]
            "#,
        )
        .unwrap();

        assert_eq!(config.app.name, "upload-test");
        assert_eq!(config.app.version_minor, 1);
        assert_eq!(config.log.level_filter(), log::LevelFilter::Debug);
        assert_eq!(config.cgpu.resolve_mode, ResolveMode::Unchecked);
        assert_eq!(config.cgpu.device_index, 1);
        assert_eq!(config.stager.kind, StagerKind::Synchronous);
        assert_eq!(config.stager.inline_update_threshold, 65535);
        assert_eq!(config.upload.textures.len(), 2);
        assert_eq!(config.upload.asset_root, None);
    }
}
