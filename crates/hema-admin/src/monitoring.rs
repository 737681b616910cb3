//! 系统监控
//!
//! HTTP 请求指标、Prometheus 文本导出与健康检查

use anyhow::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// 系统监控指标收集器
#[derive(Debug, Clone)]
pub struct SystemMonitor {
    /// 与流水线指标共用的注册表
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    system_start_time: Instant,
}

/// 系统健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub components: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// 运行时间（秒）
    pub uptime_secs: u64,
}

/// 健康等级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

/// 组件健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub message: String,
}

impl ComponentHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthLevel::Healthy,
            message: message.into(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthLevel::Degraded,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthLevel::Unhealthy,
            message: message.into(),
        }
    }
}

impl SystemMonitor {
    pub fn new(registry: Registry) -> Result<Self> {
        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "route", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "route"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            system_start_time: Instant::now(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 记录HTTP请求
    pub fn record_http_request(&self, method: &str, route: &str, status: u16, duration: Duration) {
        debug!("HTTP request: {} {} - {} in {:?}", method, route, status, duration);

        self.http_requests_total
            .with_label_values(&[method, route, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, route])
            .observe(duration.as_secs_f64());
    }

    /// 导出 Prometheus 文本格式
    pub fn get_prometheus_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    pub fn uptime(&self) -> Duration {
        self.system_start_time.elapsed()
    }

    /// 汇总各组件状态，任一组件不健康则整体不健康
    pub fn health_status(&self, components: HashMap<String, ComponentHealth>) -> HealthStatus {
        let mut status = HealthLevel::Healthy;
        for component in components.values() {
            match component.status {
                HealthLevel::Unhealthy => {
                    status = HealthLevel::Unhealthy;
                    break;
                }
                HealthLevel::Degraded => status = HealthLevel::Degraded,
                HealthLevel::Healthy => {}
            }
        }

        HealthStatus {
            status,
            components,
            timestamp: chrono::Utc::now(),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_metrics_are_exported() {
        let monitor = SystemMonitor::new(Registry::new()).unwrap();
        monitor.record_http_request("POST", "/api/v1/samples", 201, Duration::from_millis(30));

        let text = monitor.get_prometheus_metrics().unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("route=\"/api/v1/samples\""));
    }

    #[test]
    fn test_health_aggregation() {
        let monitor = SystemMonitor::new(Registry::new()).unwrap();

        let mut components = HashMap::new();
        components.insert("model".to_string(), ComponentHealth::healthy("loaded"));
        assert_eq!(monitor.health_status(components.clone()).status, HealthLevel::Healthy);

        components.insert("storage".to_string(), ComponentHealth::degraded("slow"));
        assert_eq!(monitor.health_status(components.clone()).status, HealthLevel::Degraded);

        components.insert("database".to_string(), ComponentHealth::unhealthy("down"));
        assert_eq!(monitor.health_status(components).status, HealthLevel::Unhealthy);
    }
}
