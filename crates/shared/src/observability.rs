//! 日志初始化
//!
//! 生产环境输出 JSON 便于日志平台采集，本地开发输出可读格式。
//! 过滤规则优先取 RUST_LOG 环境变量，其次取配置文件。

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// 初始化全局日志订阅者，进程启动时调用一次
pub fn init_tracing(service_name: &str, config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!(service = service_name, "日志系统初始化完成");
}
