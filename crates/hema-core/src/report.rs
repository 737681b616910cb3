//! 诊断报告模型
//!
//! 报告生成后只有审阅状态可以变化，且只能通过 [`Report::apply_review`]
//! 按受限的状态转换进行。

use crate::error::{HemaError, Result};
use crate::models::{InferenceResult, PatientInfo, RiskAssessment, Sample};
use crate::policy::RiskPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 样本元数据（不含影像数据），随报告持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: Uuid,
    pub patient_id: String,
    pub checksum: String,
    pub original_filename: String,
    pub received_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl From<&Sample> for SampleRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            sample_id: sample.id(),
            patient_id: sample.patient_id().to_string(),
            checksum: sample.checksum().to_string(),
            original_filename: sample.original_filename().to_string(),
            received_at: sample.received_at(),
            size_bytes: sample.bytes().len() as u64,
        }
    }
}

/// 文档存储中的报告文件引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub key: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub content_type: String,
}

/// 报告审阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    PendingReview,
    Reviewed,
    Archived,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::PendingReview => "PENDING_REVIEW",
            ReviewStatus::Reviewed => "REVIEWED",
            ReviewStatus::Archived => "ARCHIVED",
        }
    }

    /// 执行审阅状态转换
    pub fn transition(self, action: ReviewAction) -> Result<ReviewStatus> {
        match (self, action) {
            (ReviewStatus::PendingReview, ReviewAction::MarkReviewed) => Ok(ReviewStatus::Reviewed),
            (ReviewStatus::Reviewed, ReviewAction::Archive) => Ok(ReviewStatus::Archived),
            (from, event) => Err(HemaError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = HemaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING_REVIEW" => Ok(ReviewStatus::PendingReview),
            "REVIEWED" => Ok(ReviewStatus::Reviewed),
            "ARCHIVED" => Ok(ReviewStatus::Archived),
            other => Err(HemaError::Internal(format!("unknown review status: {}", other))),
        }
    }
}

/// 医生端允许的审阅操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewAction {
    MarkReviewed,
    Archive,
}

/// 审阅状态及最近一次操作者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    pub status: ReviewStatus,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReviewState {
    fn pending() -> Self {
        Self {
            status: ReviewStatus::PendingReview,
            updated_by: None,
            updated_at: None,
        }
    }
}

/// 持久化的诊断报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    id: Uuid,
    sample: SampleRecord,
    patient: PatientInfo,
    inference: InferenceResult,
    assessment: RiskAssessment,
    policy: RiskPolicy,
    recommendations: Vec<String>,
    document: DocumentRef,
    generated_at: DateTime<Utc>,
    review: ReviewState,
}

impl Report {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        sample: SampleRecord,
        patient: PatientInfo,
        inference: InferenceResult,
        assessment: RiskAssessment,
        policy: RiskPolicy,
        recommendations: Vec<String>,
        document: DocumentRef,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sample,
            patient,
            inference,
            assessment,
            policy,
            recommendations,
            document,
            generated_at,
            review: ReviewState::pending(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sample(&self) -> &SampleRecord {
        &self.sample
    }

    pub fn checksum(&self) -> &str {
        &self.sample.checksum
    }

    pub fn patient(&self) -> &PatientInfo {
        &self.patient
    }

    pub fn inference(&self) -> &InferenceResult {
        &self.inference
    }

    pub fn assessment(&self) -> &RiskAssessment {
        &self.assessment
    }

    /// 生成报告时使用的策略快照
    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn review(&self) -> &ReviewState {
        &self.review
    }

    pub fn status(&self) -> ReviewStatus {
        self.review.status
    }

    /// 唯一允许的修改入口：按受限转换更新审阅状态
    pub fn apply_review(
        &mut self,
        action: ReviewAction,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<ReviewStatus> {
        if actor.trim().is_empty() {
            return Err(HemaError::InvalidInput("reviewer must not be empty".to_string()));
        }

        let next = self.review.status.transition(action)?;
        self.review = ReviewState {
            status: next,
            updated_by: Some(actor.to_string()),
            updated_at: Some(at),
        };
        Ok(next)
    }
}
