//! Gatling 工具集
//!
//! 提供日志初始化与配置文件加载。

pub mod config;
pub mod init_log;
