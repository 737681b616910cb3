//! # HemaBridge 存储模块
//!
//! 诊断流水线唯一的外部写入点：
//! - 文档存储：报告 PDF 文件（本地文件系统、内存或 S3）
//! - 记录存储：报告记录，按样本校验和保证唯一

pub mod repository;
pub mod storage;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use repository::{InMemoryReportRepository, InsertOutcome, ReportRepository};
pub use storage::{DocumentStore, DocumentStoreConfig, ObjectDocumentStore};
#[cfg(feature = "postgres")]
pub use postgres::PgReportRepository;
