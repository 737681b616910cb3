//! # HemaBridge 管理模块
//!
//! 提供配置管理、日志初始化与系统监控等运维功能

pub mod config;
pub mod logging;
pub mod monitoring;

pub use config::{
    ConfigManager, ConfigValidator, HemaConfig, LogFormat, LoggingConfig, RepositoryBackend,
};
pub use logging::init_logging;
pub use monitoring::{ComponentHealth, HealthLevel, HealthStatus, SystemMonitor};
