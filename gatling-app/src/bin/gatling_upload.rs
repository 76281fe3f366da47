use anyhow::Context;
use gatling_app::config::GatlingConfig;
use gatling_app::upload::run_upload;
use gatling_cgpu::{CgpuContext, VulkanBackend};
use gatling_crate_tools::config::load_toml_or_default;
use gatling_crate_tools::init_log::init_log;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "gatling.toml".to_string());
    let config: GatlingConfig = load_toml_or_default(&config_path)?;
    init_log(config.log.level_filter());
    log::info!("config loaded from {}", config_path);

    let backend = VulkanBackend::new(&config.app).context("初始化 Vulkan 失败")?;
    let mut ctx = CgpuContext::initialize(backend, config.cgpu.clone());

    let result = run_upload(&mut ctx, &config);
    ctx.terminate().context("销毁 cgpu 上下文失败")?;

    let report = result?;
    log::info!(
        "uploaded {:.2}MiB pattern and {} textures ({} 3D) in {:.2?}",
        report.pattern_bytes as f64 / (1024.0 * 1024.0),
        report.textures_2d + report.textures_3d,
        report.textures_3d,
        report.elapsed
    );
    Ok(())
}
