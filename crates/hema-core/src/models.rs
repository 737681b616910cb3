//! 核心数据模型定义

use crate::error::{HemaError, Result};
use crate::utils::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// 概率向量求和允许的数值误差
pub const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// 患者提交的一份血细胞影像样本
///
/// 创建后不可变，以内容校验和标识，用于检测重复提交。
#[derive(Debug, Clone)]
pub struct Sample {
    id: Uuid,
    patient_id: String,
    received_at: DateTime<Utc>,
    original_filename: String,
    checksum: String,
    bytes: Arc<[u8]>,
}

impl Sample {
    /// 接收上传的影像，计算 SHA-256 校验和
    pub fn new(
        patient_id: impl Into<String>,
        original_filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let patient_id = patient_id.into();
        if patient_id.trim().is_empty() {
            return Err(HemaError::InvalidInput("patient id must not be empty".to_string()));
        }

        let checksum = sha256_hex(&bytes);
        Ok(Self {
            id: Uuid::new_v4(),
            patient_id,
            received_at: Utc::now(),
            original_filename: original_filename.into(),
            checksum,
            bytes: Arc::from(bytes),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// 共享的影像数据，便于移交到阻塞线程池
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

/// 报告中打印的患者信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub patient_id: String,
    pub name: Option<String>,
    pub age: Option<u32>,
}

impl PatientInfo {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Default::default()
        }
    }
}

/// 分类器输出类别
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSpec {
    pub label: String,
    /// 是否为恶性细胞类别（如原始粒细胞）
    pub malignant: bool,
}

impl ClassSpec {
    pub fn benign(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            malignant: false,
        }
    }

    pub fn malignant(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            malignant: true,
        }
    }

    /// 训练模型的默认五分类血细胞类别表，顺序与模型输出一致
    pub fn blood_cell_classes() -> Vec<ClassSpec> {
        vec![
            ClassSpec::benign("monocyte"),
            ClassSpec::malignant("myeloblast"),
            ClassSpec::benign("erythroblast"),
            ClassSpec::benign("segmented_neutrophil"),
            ClassSpec::benign("basophil"),
        ]
    }
}

/// 模型版本：配置的标签加权重文件指纹
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelVersion {
    pub label: String,
    /// 权重文件的 SHA-256
    pub fingerprint: String,
}

impl ModelVersion {
    pub fn new(label: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.fingerprint.chars().take(12).collect();
        write!(f, "{}@{}", self.label, short)
    }
}

/// 分类器对一个样本的原始输出
///
/// 只能通过校验构造函数创建，之后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    id: Uuid,
    probabilities: Vec<f32>,
    labels: Vec<String>,
    top_class: usize,
    model_version: ModelVersion,
    produced_at: DateTime<Utc>,
}

impl InferenceResult {
    /// 校验概率向量并确定最高概率类别
    ///
    /// 并列最高时取下标较小者；是否升级风险由风险解释器决定。
    pub fn new(
        probabilities: Vec<f32>,
        labels: Vec<String>,
        model_version: ModelVersion,
    ) -> Result<Self> {
        if probabilities.is_empty() {
            return Err(HemaError::inference("model returned an empty probability vector"));
        }
        if probabilities.len() != labels.len() {
            return Err(HemaError::inference(format!(
                "model returned {} probabilities for {} classes",
                probabilities.len(),
                labels.len()
            )));
        }
        if let Some((idx, p)) = probabilities
            .iter()
            .enumerate()
            .find(|(_, p)| !p.is_finite() || **p < 0.0 || **p > 1.0)
        {
            return Err(HemaError::inference(format!(
                "probability {} for class {} is outside [0, 1]",
                p, labels[idx]
            )));
        }

        let sum: f32 = probabilities.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
            return Err(HemaError::inference(format!(
                "probabilities sum to {:.6}, expected 1.0",
                sum
            )));
        }

        let mut top_class = 0;
        for (idx, p) in probabilities.iter().enumerate() {
            if *p > probabilities[top_class] {
                top_class = idx;
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            probabilities,
            labels,
            top_class,
            model_version,
            produced_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn top_class(&self) -> usize {
        self.top_class
    }

    pub fn top_label(&self) -> &str {
        &self.labels[self.top_class]
    }

    pub fn top_probability(&self) -> f32 {
        self.probabilities[self.top_class]
    }

    pub fn model_version(&self) -> &ModelVersion {
        &self.model_version
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// 各类别百分比，顺序与模型输出一致
    pub fn class_percentages(&self) -> Vec<(&str, f32)> {
        self.labels
            .iter()
            .zip(&self.probabilities)
            .map(|(label, p)| (label.as_str(), p * 100.0))
            .collect()
    }
}

/// 风险等级，按严重程度排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Moderate => "MODERATE",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    /// 面向医生和患者的一致说明
    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Regular monitoring advised",
            RiskLevel::Moderate => "Further evaluation recommended",
            RiskLevel::High => "Immediate medical attention required",
            RiskLevel::Critical => "Urgent hematology referral required",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = HemaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOW" => Ok(RiskLevel::Low),
            "MODERATE" => Ok(RiskLevel::Moderate),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            other => Err(HemaError::Internal(format!("unknown risk level: {}", other))),
        }
    }
}

/// 由推理结果推导出的临床风险评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// 最高类别概率，范围 [0, 1]
    pub confidence: f32,
    pub top_class: String,
    pub findings: Vec<String>,
}

impl RiskAssessment {
    /// 例如 "HIGH Risk - Immediate medical attention required"
    pub fn headline(&self) -> String {
        format!("{} Risk - {}", self.level, self.level.description())
    }
}
