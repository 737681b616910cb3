//! # HemaBridge 工作流模块
//!
//! 驱动一次诊断会话走完整条流水线：
//! - 会话状态机：单向推进，失败后只能显式重启
//! - 编排器：预处理、推理、风险解释、报告编译，含重试与取消
//! - 流水线指标：按结果、阶段统计的 Prometheus 指标

pub mod engine;
pub mod metrics;
pub mod session;
pub mod state_machine;

pub use engine::{
    DiagnosticError, DiagnosticOrchestrator, DiagnosticOutcome, RetryPolicy, Submission,
};
pub use metrics::PipelineMetrics;
pub use session::{DiagnosticSession, StageFailure, StateRecord};
pub use state_machine::{SessionEvent, SessionState, SessionStateMachine};
