//! # HemaBridge 分类器适配模块
//!
//! 封装预训练的血细胞分类模型：
//! - 进程级共享模型，首次使用时惰性加载，且只加载一次
//! - 显式的预热与卸载生命周期
//! - 记录每次推理所用的模型版本，便于审计

pub mod adapter;
pub mod artifact;
pub mod backend;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use adapter::{ClassifierAdapter, LoadedModel};
pub use artifact::{ModelArtifact, ModelConfig, OutputActivation};
pub use backend::{BackendError, ModelBackend, ModelLoader};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxBackend, OnnxLoader};
