//! 错误定义模块

use thiserror::Error;
use uuid::Uuid;

/// HemaBridge 统一错误类型
#[derive(Error, Debug)]
pub enum HemaError {
    /// 上传影像无效或格式不受支持（调用方错误，不重试）
    #[error("无效输入: {0}")]
    InvalidInput(String),

    /// 模型无法加载，对整个进程是致命的
    #[error("模型不可用: {0}")]
    ModelUnavailable(String),

    /// 前向推理失败；`transient` 为真时允许编排器重试
    #[error("推理错误: {message}")]
    Inference { message: String, transient: bool },

    /// 同一样本已存在权威报告（幂等保护，属于良性信号）
    #[error("报告已存在: 样本 {checksum} 对应报告 {existing}")]
    DuplicateReport { checksum: String, existing: Uuid },

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("会话已取消: {0}")]
    Cancelled(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl HemaError {
    /// 可重试的瞬时推理错误
    pub fn transient_inference(message: impl Into<String>) -> Self {
        HemaError::Inference {
            message: message.into(),
            transient: true,
        }
    }

    /// 不可重试的推理错误（如张量形状错误）
    pub fn inference(message: impl Into<String>) -> Self {
        HemaError::Inference {
            message: message.into(),
            transient: false,
        }
    }

    /// 只有瞬时推理错误允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, HemaError::Inference { transient: true, .. })
    }

    /// 稳定的错误分类名，用于审计日志和监控标签
    pub fn kind(&self) -> &'static str {
        match self {
            HemaError::InvalidInput(_) => "invalid_input",
            HemaError::ModelUnavailable(_) => "model_unavailable",
            HemaError::Inference { .. } => "inference",
            HemaError::DuplicateReport { .. } => "duplicate_report",
            HemaError::Storage(_) => "storage",
            HemaError::Config(_) => "config",
            HemaError::NotFound(_) => "not_found",
            HemaError::InvalidStateTransition { .. } => "invalid_state_transition",
            HemaError::Cancelled(_) => "cancelled",
            HemaError::Serialization(_) => "serialization",
            HemaError::Io(_) => "io",
            HemaError::Internal(_) => "internal",
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for HemaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => HemaError::NotFound(err.to_string()),
            other => HemaError::Storage(other.to_string()),
        }
    }
}

/// HemaBridge 统一结果类型
pub type Result<T> = std::result::Result<T, HemaError>;
