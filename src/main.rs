use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use subtitle_core::AppConfig;
use subtitle_dispatch::{wait_for_shutdown_signal, Application, ShutdownManager};
use subtitle_infrastructure::{init_logging, install_prometheus_recorder};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("subtitle-dispatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("字幕翻译任务分发引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时搜索 config/subtitle.toml 和 subtitle.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).with_context(|| {
        format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>"))
    })?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    info!("启动字幕翻译分发服务 v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let metrics_handle = if config.observability.metrics_enabled {
        Some(install_prometheus_recorder().context("安装Prometheus导出器失败")?)
    } else {
        None
    };

    let app = Arc::new(Application::new(config, metrics_handle).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    // 服务提前退出时不再等待关闭信号
    let exited_early = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        result = &mut app_handle => Some(result),
    };

    match exited_early {
        Some(Ok(Ok(()))) => info!("应用已停止"),
        Some(Ok(Err(e))) => return Err(e),
        Some(Err(e)) => return Err(e).context("应用任务异常结束"),
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
                Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
                Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
                Ok(Err(e)) => error!("应用任务异常结束: {e}"),
                Err(_) => warn!("应用关闭超时，强制退出"),
            }
        }
    }

    info!("字幕翻译分发服务已退出");
    Ok(())
}
