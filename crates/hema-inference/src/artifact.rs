//! 模型文件与模型配置

use hema_core::utils::sha256_hex;
use hema_core::{ClassSpec, HemaError, ModelVersion, Result, TensorSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 模型输出的激活方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// 模型已输出概率
    Probabilities,
    /// 模型输出原始 logits，需要做 softmax
    Logits,
}

/// 分类模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 冻结权重文件路径
    pub path: PathBuf,
    /// 版本标签，与文件指纹一起组成模型版本
    pub version_label: String,
    pub input: TensorSpec,
    /// 输出类别，顺序与模型输出一致
    pub labels: Vec<String>,
    pub activation: OutputActivation,
    /// 推理线程数
    pub intra_threads: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(HemaError::Config("model labels must not be empty".to_string()));
        }
        if self.version_label.trim().is_empty() {
            return Err(HemaError::Config("model version label must not be empty".to_string()));
        }
        if self.intra_threads == 0 {
            return Err(HemaError::Config("intra_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            path: self.path.clone(),
            label: self.version_label.clone(),
            input: self.input,
            intra_threads: self.intra_threads,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("model/blood_cancer_model.onnx"),
            version_label: "blood-cancer-v1".to_string(),
            input: TensorSpec::default(),
            labels: ClassSpec::blood_cell_classes()
                .into_iter()
                .map(|c| c.label)
                .collect(),
            activation: OutputActivation::Probabilities,
            intra_threads: 2,
        }
    }
}

/// 只读的模型文件
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub label: String,
    pub input: TensorSpec,
    pub intra_threads: usize,
}

impl ModelArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 权重文件的 SHA-256 指纹
    pub fn fingerprint(&self) -> Result<String> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            HemaError::ModelUnavailable(format!(
                "cannot read model file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(sha256_hex(&bytes))
    }

    /// 版本标签加文件指纹
    pub fn version(&self) -> Result<ModelVersion> {
        Ok(ModelVersion::new(self.label.clone(), self.fingerprint()?))
    }
}
