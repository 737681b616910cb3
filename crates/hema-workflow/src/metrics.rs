//! 流水线指标

use crate::state_machine::SessionState;
use hema_core::{HemaError, Result};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::time::Duration;

/// 诊断流水线的 Prometheus 指标
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    sessions_total: IntCounterVec,
    stage_failures_total: IntCounterVec,
    inference_retries_total: IntCounter,
    stage_duration: HistogramVec,
}

impl PipelineMetrics {
    /// 创建指标并注册到给定 registry
    pub fn new(registry: &Registry) -> Result<Self> {
        let sessions_total = IntCounterVec::new(
            Opts::new("hema_sessions_total", "Diagnostic sessions by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        let stage_failures_total = IntCounterVec::new(
            Opts::new("hema_stage_failures_total", "Session failures by stage and error kind"),
            &["stage", "kind"],
        )
        .map_err(metrics_error)?;

        let inference_retries_total = IntCounter::with_opts(Opts::new(
            "hema_inference_retries_total",
            "Retries after transient inference faults",
        ))
        .map_err(metrics_error)?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("hema_stage_duration_seconds", "Pipeline stage duration")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["stage"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(sessions_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(stage_failures_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(inference_retries_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(stage_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            sessions_total,
            stage_failures_total,
            inference_retries_total,
            stage_duration,
        })
    }

    pub fn record_session(&self, outcome: &str) {
        self.sessions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_stage_failure(&self, stage: SessionState, kind: &str) {
        self.stage_failures_total
            .with_label_values(&[stage.as_str(), kind])
            .inc();
    }

    pub fn record_inference_retry(&self) {
        self.inference_retries_total.inc();
    }

    pub fn observe_stage(&self, stage: SessionState, elapsed: Duration) {
        self.stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn sessions(&self, outcome: &str) -> u64 {
        self.sessions_total.with_label_values(&[outcome]).get()
    }

    pub fn inference_retries(&self) -> u64 {
        self.inference_retries_total.get()
    }
}

fn metrics_error(e: prometheus::Error) -> HemaError {
    HemaError::Internal(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(&registry).unwrap();

        metrics.record_session("completed");
        metrics.record_stage_failure(SessionState::Preprocessing, "invalid_input");
        metrics.record_inference_retry();
        metrics.observe_stage(SessionState::Inferring, Duration::from_millis(20));

        assert_eq!(metrics.sessions("completed"), 1);
        assert_eq!(metrics.inference_retries(), 1);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"hema_stage_duration_seconds".to_string()));
        assert!(names.contains(&"hema_stage_failures_total".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PipelineMetrics::new(&registry).unwrap();
        assert!(PipelineMetrics::new(&registry).is_err());
    }
}
