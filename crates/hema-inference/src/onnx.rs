//! ONNX Runtime 推理后端
//!
//! `ort::Session::run` 需要 `&mut self`，因此会话放在 `Mutex` 中，
//! 对外仍以只读的 [`ModelBackend`] 暴露。

use crate::artifact::ModelArtifact;
use crate::backend::{BackendError, ModelBackend, ModelLoader};
use hema_core::{HemaError, ImageTensor, Result};
use ort::session::Session;
use ort::value::TensorRef;
use std::sync::Mutex;
use tracing::info;

/// 基于 ONNX Runtime 的模型后端
pub struct OnnxBackend {
    session: Mutex<Session>,
}

impl OnnxBackend {
    pub fn load(artifact: &ModelArtifact) -> Result<Self> {
        let path = artifact.path();
        if !path.exists() {
            return Err(HemaError::ModelUnavailable(format!(
                "model file not found at {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| HemaError::ModelUnavailable(e.to_string()))?
            .with_intra_threads(artifact.intra_threads)
            .map_err(|e: ort::Error| HemaError::ModelUnavailable(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e: ort::Error| HemaError::ModelUnavailable(format!("ONNX load failed: {e}")))?;

        info!("ONNX classifier loaded from {}", path.display());

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl ModelBackend for OnnxBackend {
    fn forward(&self, tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError> {
        let [n, h, w, c] = tensor.shape();
        let array = ndarray::Array4::from_shape_vec((n, h, w, c), tensor.data().to_vec())
            .map_err(|e| BackendError::Shape(e.to_string()))?;
        let input = TensorRef::from_array_view(&array)
            .map_err(|e| BackendError::Shape(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| BackendError::Fatal("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| classify_run_error(&e.to_string()))?;

        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::Fatal(format!("output extraction: {e}")))?;

        Ok(data.to_vec())
    }
}

/// 将运行时错误区分为瞬时资源故障与其他故障
fn classify_run_error(message: &str) -> BackendError {
    let lower = message.to_lowercase();
    if lower.contains("allocate") || lower.contains("out of memory") || lower.contains("resource exhausted") {
        BackendError::Transient(message.to_string())
    } else if lower.contains("shape") || lower.contains("dimension") {
        BackendError::Shape(message.to_string())
    } else {
        BackendError::Fatal(message.to_string())
    }
}

/// 加载 ONNX 模型的 [`ModelLoader`]
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
    fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>> {
        Ok(Box::new(OnnxBackend::load(artifact)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_run_error() {
        assert!(matches!(
            classify_run_error("Failed to allocate memory for requested buffer"),
            BackendError::Transient(_)
        ));
        assert!(matches!(
            classify_run_error("Got invalid dimensions for input"),
            BackendError::Shape(_)
        ));
        assert!(matches!(classify_run_error("unknown op"), BackendError::Fatal(_)));
    }
}
