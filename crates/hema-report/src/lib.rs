//! # HemaBridge 报告模块
//!
//! 把推理结果与风险评估编译成不可变的诊断报告：
//! - 处理建议
//! - PDF 文档渲染
//! - 幂等写入与审阅状态流转

pub mod compiler;
pub mod pdf;
pub mod recommendations;
pub mod review;

#[cfg(test)]
mod test_support;

pub use compiler::{document_key, verify_report, ReportCompiler, ReportDraft};
pub use pdf::PdfRenderer;
pub use recommendations::recommendations_for;
pub use review::ReviewDesk;
