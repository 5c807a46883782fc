//! 日志模块
//!
//! 提供默认的 Tracing 日志初始化器。日志级别通过 `RUST_LOG` 环境变量过滤，
//! 生产环境建议启用 JSON 输出以便于日志收集。

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化默认的人类可读日志订阅器。
///
/// 未设置 `RUST_LOG` 时默认 `info` 级别。重复初始化会 panic，
/// 因此只应在进程入口调用一次。
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

/// 初始化 JSON 格式日志订阅器，字段展平便于结构化检索。
pub fn init_json_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().flatten_event(true))
        .init();
}
