//! 推理后端抽象

use crate::artifact::ModelArtifact;
use hema_core::{HemaError, ImageTensor, Result};
use thiserror::Error;

/// 推理后端错误
#[derive(Error, Debug)]
pub enum BackendError {
    /// 资源耗尽等瞬时故障，可由编排器重试
    #[error("资源暂时不可用: {0}")]
    Transient(String),

    #[error("输入张量形状错误: {0}")]
    Shape(String),

    #[error("前向推理失败: {0}")]
    Fatal(String),
}

impl From<BackendError> for HemaError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => HemaError::transient_inference(msg),
            other => HemaError::inference(other.to_string()),
        }
    }
}

/// 已加载的模型，只读，可被多个会话并发调用
pub trait ModelBackend: Send + Sync {
    /// 前向推理，返回与类别表顺序一致的原始输出
    fn forward(&self, tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError>;
}

/// 从冻结的权重文件构建推理后端
pub trait ModelLoader: Send + Sync {
    /// 加载失败应返回 [`HemaError::ModelUnavailable`]
    fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>>;
}
