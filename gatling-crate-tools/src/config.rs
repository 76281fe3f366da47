use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

/// 从 TOML 文件加载配置
pub fn load_toml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> anyhow::Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
    let config = toml::from_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path))?;
    log::info!("loaded config from {:?}", path);
    Ok(config)
}

/// 文件存在时加载，否则使用默认配置
pub fn load_toml_or_default<T: DeserializeOwned + Default, P: AsRef<Path>>(path: P) -> anyhow::Result<T> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("config {:?} not found, using defaults", path);
        return Ok(T::default());
    }
    load_toml(path)
}
