use crate::compiler::ReportDraft;
use crate::recommendations::recommendations_for;
use async_trait::async_trait;
use chrono::Utc;
use hema_core::{
    ClassSpec, DocumentRef, InferenceResult, ModelVersion, PatientInfo, Report, Result,
    ReviewAction, RiskPolicy, Sample, SampleRecord, ThresholdTable,
};
use hema_risk::RiskInterpreter;
use hema_storage::{DocumentStore, InsertOutcome, ObjectDocumentStore, ReportRepository};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub fn binary_interpreter() -> RiskInterpreter {
    RiskInterpreter::new(RiskPolicy {
        thresholds: ThresholdTable::default(),
        tie_epsilon: 0.05,
        secondary_alert: Some(0.20),
        classes: vec![ClassSpec::malignant("cancerous"), ClassSpec::benign("benign")],
    })
    .unwrap()
}

pub fn inference(probabilities: Vec<f32>) -> InferenceResult {
    InferenceResult::new(
        probabilities,
        vec!["cancerous".to_string(), "benign".to_string()],
        ModelVersion::new("test", "0123456789abcdef"),
    )
    .unwrap()
}

pub fn ordered_sample(patient: &str, bytes: &[u8]) -> (SampleRecord, PatientInfo) {
    let sample = Sample::new(patient, "cells.png", bytes.to_vec()).unwrap();
    let mut info = PatientInfo::new(patient);
    info.name = Some("Test Patient".to_string());
    info.age = Some(42);
    (SampleRecord::from(&sample), info)
}

pub fn draft(patient: &str, bytes: &[u8], probabilities: Vec<f32>) -> ReportDraft {
    let (sample, patient) = ordered_sample(patient, bytes);
    let inference = inference(probabilities);
    let assessment = binary_interpreter().assess(&inference).unwrap();
    ReportDraft {
        id: Uuid::new_v4(),
        recommendations: recommendations_for(assessment.level),
        sample,
        patient,
        inference,
        assessment,
        generated_at: Utc::now(),
    }
}

pub fn stored_report(patient: &str, bytes: &[u8], probabilities: Vec<f32>) -> Report {
    let draft = draft(patient, bytes, probabilities);
    Report::new(
        draft.id,
        draft.sample,
        draft.patient,
        draft.inference,
        draft.assessment,
        binary_interpreter().policy().clone(),
        draft.recommendations,
        DocumentRef {
            key: format!("reports/x/{}.pdf", draft.id),
            size_bytes: 0,
            sha256: String::new(),
            content_type: "application/pdf".to_string(),
        },
        draft.generated_at,
    )
}

/// 记录写入与删除次数的文档存储
pub struct CountingDocuments {
    inner: ObjectDocumentStore,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingDocuments {
    pub fn new() -> Self {
        Self {
            inner: ObjectDocumentStore::in_memory(),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingDocuments {
    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<DocumentRef> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, content, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }
}

/// 查重总是落空的存储，模拟两次编译同时通过查重
pub struct HiddenRepository {
    inner: Arc<dyn ReportRepository>,
}

impl HiddenRepository {
    pub fn new(inner: Arc<dyn ReportRepository>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ReportRepository for HiddenRepository {
    async fn find_by_checksum(&self, _checksum: &str) -> Result<Option<Report>> {
        Ok(None)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Report>> {
        self.inner.get(id).await
    }

    async fn insert_if_absent(&self, report: &Report) -> Result<InsertOutcome> {
        self.inner.insert_if_absent(report).await
    }

    async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<Report>> {
        self.inner.list_for_patient(patient_id).await
    }

    async fn apply_review(&self, id: Uuid, action: ReviewAction, actor: &str) -> Result<Report> {
        self.inner.apply_review(id, action, actor).await
    }
}
