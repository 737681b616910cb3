//! # HemaBridge Web 模块
//!
//! 诊断流水线的 HTTP 入口：样本上传、报告查询与下载、审阅操作、健康检查和指标导出。

pub mod handlers;
pub mod server;

pub use handlers::{ApiError, ReportSummary, SubmissionResponse};
pub use server::{create_app, AppState, WebServer, WebServerConfig};
