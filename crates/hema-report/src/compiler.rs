//! 报告编译器
//!
//! 流程：按校验和查重 → 一致性校验 → 生成建议 → 渲染 PDF →
//! 写入文档 → 原子插入记录。同一样本校验和最多只有一份权威报告。

use crate::pdf::PdfRenderer;
use crate::recommendations::recommendations_for;
use chrono::{DateTime, Utc};
use hema_core::{
    HemaError, InferenceResult, PatientInfo, Report, Result, RiskAssessment, SampleRecord,
};
use hema_risk::RiskInterpreter;
use hema_storage::{DocumentStore, InsertOutcome, ReportRepository};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PDF_CONTENT_TYPE: &str = "application/pdf";

/// 渲染前的报告内容
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub id: Uuid,
    pub sample: SampleRecord,
    pub patient: PatientInfo,
    pub inference: InferenceResult,
    pub assessment: RiskAssessment,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// 报告文档的存储键
pub fn document_key(checksum: &str, report_id: Uuid) -> String {
    format!("reports/{}/{}.pdf", checksum, report_id)
}

/// 用报告自带的策略快照重新计算评估，确认报告内部一致
pub fn verify_report(report: &Report) -> Result<()> {
    RiskInterpreter::new(report.policy().clone())?.verify(report.inference(), report.assessment())
}

/// 报告编译器
pub struct ReportCompiler {
    interpreter: Arc<RiskInterpreter>,
    documents: Arc<dyn DocumentStore>,
    repository: Arc<dyn ReportRepository>,
    renderer: PdfRenderer,
}

impl ReportCompiler {
    pub fn new(
        interpreter: Arc<RiskInterpreter>,
        documents: Arc<dyn DocumentStore>,
        repository: Arc<dyn ReportRepository>,
    ) -> Self {
        Self {
            interpreter,
            documents,
            repository,
            renderer: PdfRenderer,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ReportRepository> {
        &self.repository
    }

    /// 按样本校验和查找已有报告
    pub async fn existing(&self, checksum: &str) -> Result<Option<Report>> {
        self.repository.find_by_checksum(checksum).await
    }

    /// 编译并持久化报告
    ///
    /// 该样本已有报告时返回 [`HemaError::DuplicateReport`]，不产生任何写入。
    pub async fn compile(
        &self,
        sample: SampleRecord,
        patient: PatientInfo,
        inference: InferenceResult,
        assessment: RiskAssessment,
    ) -> Result<Report> {
        if let Some(existing) = self.repository.find_by_checksum(&sample.checksum).await? {
            debug!(checksum = %sample.checksum, report_id = %existing.id(), "Report already compiled");
            return Err(HemaError::DuplicateReport {
                checksum: sample.checksum,
                existing: existing.id(),
            });
        }

        if sample.patient_id != patient.patient_id {
            return Err(HemaError::InvalidInput(format!(
                "sample belongs to patient {} but report targets {}",
                sample.patient_id, patient.patient_id
            )));
        }
        self.interpreter.verify(&inference, &assessment)?;

        let draft = ReportDraft {
            id: Uuid::new_v4(),
            recommendations: recommendations_for(assessment.level),
            sample,
            patient,
            inference,
            assessment,
            generated_at: Utc::now(),
        };

        let renderer = self.renderer;
        let (draft, pdf) = tokio::task::spawn_blocking(move || {
            let pdf = renderer.render_report(&draft);
            (draft, pdf)
        })
        .await
        .map_err(|e| HemaError::Internal(format!("report render task failed: {}", e)))?;
        let pdf = pdf?;

        let key = document_key(&draft.sample.checksum, draft.id);
        let document = self.documents.put(&key, pdf, PDF_CONTENT_TYPE).await?;

        let report = Report::new(
            draft.id,
            draft.sample,
            draft.patient,
            draft.inference,
            draft.assessment,
            self.interpreter.policy().clone(),
            draft.recommendations,
            document,
            draft.generated_at,
        );

        let outcome = match self.repository.insert_if_absent(&report).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_document(&key).await;
                return Err(e);
            }
        };

        match outcome {
            InsertOutcome::Inserted => {
                info!(
                    report_id = %report.id(),
                    checksum = %report.checksum(),
                    level = %report.assessment().level,
                    "Report compiled"
                );
                Ok(report)
            }
            InsertOutcome::Duplicate(existing) => {
                // 并发编译同一样本，保留先写入的报告
                self.discard_document(&key).await;
                Err(HemaError::DuplicateReport {
                    checksum: report.checksum().to_string(),
                    existing: existing.id(),
                })
            }
        }
    }

    pub async fn report(&self, id: Uuid) -> Result<Report> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| HemaError::NotFound(format!("report {}", id)))
    }

    pub async fn reports_for_patient(&self, patient_id: &str) -> Result<Vec<Report>> {
        self.repository.list_for_patient(patient_id).await
    }

    /// 读取报告 PDF
    pub async fn document(&self, id: Uuid) -> Result<Vec<u8>> {
        let report = self.report(id).await?;
        self.documents.get(&report.document().key).await
    }

    /// 渲染患者历次报告汇总 PDF
    pub async fn patient_summary(&self, patient_id: &str) -> Result<Vec<u8>> {
        let reports = self.repository.list_for_patient(patient_id).await?;
        let patient = reports
            .last()
            .map(|r| r.patient().clone())
            .ok_or_else(|| HemaError::NotFound(format!("reports for patient {}", patient_id)))?;

        let renderer = self.renderer;
        tokio::task::spawn_blocking(move || renderer.render_summary(&patient, &reports))
            .await
            .map_err(|e| HemaError::Internal(format!("summary render task failed: {}", e)))?
    }

    async fn discard_document(&self, key: &str) {
        if let Err(e) = self.documents.delete(key).await {
            warn!(key, error = %e, "Failed to remove orphaned report document");
        }
    }
}
