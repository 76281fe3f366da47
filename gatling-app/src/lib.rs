//! gatling-upload：在真实设备上跑一遍上传路径并校验结果

pub mod config;
pub mod upload;
