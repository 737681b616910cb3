//! 日志初始化
//!
//! 基于 `tracing-subscriber`：`RUST_LOG` 优先，否则使用配置中的过滤器

use crate::config::{LogFormat, LoggingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 构造过滤器，`RUST_LOG` 存在时覆盖配置
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .with_context(|| format!("Invalid RUST_LOG filter: {}", directives)),
        _ => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log filter: {}", config.level)),
    }
}

/// 初始化全局日志订阅器，进程内只调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    tracing::info!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LoggingConfig {
            level: "info,hema_workflow=notalevel".to_string(),
            format: LogFormat::Text,
        };
        if std::env::var(EnvFilter::DEFAULT_ENV).is_err() {
            assert!(build_filter(&config).is_err());
        }
    }

    #[test]
    fn test_default_filter_builds() {
        assert!(build_filter(&LoggingConfig::default()).is_ok());
    }
}
