//! # HemaBridge
//!
//! 血细胞影像诊断流水线：上传的显微影像经过预处理、模型推理、风险解释，
//! 最终生成可审计的 PDF 报告。
//!
//! 各阶段分别位于独立的 crate 中，这里统一导出并提供按配置组装流水线的入口。

pub mod pipeline;

pub use hema_admin;
pub use hema_core;
pub use hema_imaging;
pub use hema_inference;
pub use hema_report;
pub use hema_risk;
pub use hema_storage;
pub use hema_workflow;

pub use pipeline::{assemble, open_repository, Pipeline};
