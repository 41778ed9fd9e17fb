//! edu-coordinator 入口
//!
//! 初始化日志、加载配置、构建协调器，按配置开启自动模式，并在 Ctrl+C / SIGTERM 时优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use edu_coordinator::config::load_config_or_default;
use edu_coordinator::core::shutdown::{
    run_with_graceful_shutdown, AutomatedModeCleanup, ShutdownCoordinator, ShutdownManager,
};
use edu_coordinator::observability;
use edu_coordinator::CoordinatorBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 第一个参数可指定额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config_or_default(config_path);
    let automated = config.automated.clone();

    let coordinator = Arc::new(
        CoordinatorBuilder::new(config)
            .build()
            .context("Failed to build coordinator")?,
    );
    if let Err(e) = coordinator.initialize().await {
        tracing::warn!(error = %e, "Coordination document not ready; will retry lazily");
    }

    if automated.start_on_boot {
        let duration = automated.duration_secs.map(Duration::from_secs);
        coordinator
            .start_automated_mode(duration)
            .await
            .context("Failed to start automated mode")?;
    }

    let manager = Arc::new(ShutdownManager::new());
    let mut shutdown = ShutdownCoordinator::new();
    shutdown.register(AutomatedModeCleanup::new(coordinator.clone()));

    // 调度循环在后台任务中运行；主任务只等待关闭信号
    run_with_graceful_shutdown(
        manager,
        std::future::pending::<()>(),
        || async move { shutdown.run_cleanup().await },
    )
    .await;

    Ok(())
}
