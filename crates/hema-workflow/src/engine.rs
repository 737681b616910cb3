//! 诊断编排引擎
//!
//! 协调预处理、推理、风险解释与报告编译，负责重试、取消与会话状态记录

use crate::metrics::PipelineMetrics;
use crate::session::DiagnosticSession;
use crate::state_machine::{SessionEvent, SessionState};
use hema_core::{
    HemaError, ImageTensor, PatientInfo, Report, Result, Sample, SampleRecord,
};
use hema_imaging::ImagePreprocessor;
use hema_inference::ClassifierAdapter;
use hema_report::ReportCompiler;
use hema_risk::RiskInterpreter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// 推理重试策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 瞬时推理故障的最大重试次数
    pub max_retries: u32,
    /// 首次重试前的等待，之后每次翻倍
    #[serde(with = "millis")]
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_backoff: Duration::from_millis(200),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// 一次上传
#[derive(Debug, Clone)]
pub struct Submission {
    pub patient: PatientInfo,
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Submission {
    pub fn new(patient: PatientInfo, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            patient,
            filename: filename.into(),
            bytes,
        }
    }
}

/// 会话成功结束的结果
#[derive(Debug, Clone)]
pub struct DiagnosticOutcome {
    pub session: DiagnosticSession,
    pub report: Report,
    /// 样本此前已有报告，本次未产生新报告
    pub already_reported: bool,
}

/// 会话失败
#[derive(Debug, thiserror::Error)]
#[error("诊断会话 {session_id} 在 {stage} 阶段失败: {source}")]
pub struct DiagnosticError {
    pub session_id: Uuid,
    pub stage: SessionState,
    #[source]
    pub source: HemaError,
    /// 失败后的会话，可交给 [`DiagnosticOrchestrator::retry`] 重新驱动
    pub session: Box<DiagnosticSession>,
}

/// 诊断编排器
///
/// 所有组件都放在 `Arc` 中，克隆代价很小，可以每个请求一个任务。
#[derive(Clone)]
pub struct DiagnosticOrchestrator {
    preprocessor: Arc<ImagePreprocessor>,
    classifier: Arc<ClassifierAdapter>,
    interpreter: Arc<RiskInterpreter>,
    compiler: Arc<ReportCompiler>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl DiagnosticOrchestrator {
    /// 创建编排器，并检查各组件的配置一致
    pub fn new(
        preprocessor: Arc<ImagePreprocessor>,
        classifier: Arc<ClassifierAdapter>,
        interpreter: Arc<RiskInterpreter>,
        compiler: Arc<ReportCompiler>,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        if preprocessor.config().tensor != classifier.input_spec() {
            return Err(HemaError::Config(format!(
                "preprocessor tensor {:?} does not match model input {:?}",
                preprocessor.config().tensor,
                classifier.input_spec()
            )));
        }
        if classifier.labels() != interpreter.policy().labels().as_slice() {
            return Err(HemaError::Config(format!(
                "model labels {:?} do not match risk policy classes {:?}",
                classifier.labels(),
                interpreter.policy().labels()
            )));
        }

        Ok(Self {
            preprocessor,
            classifier,
            interpreter,
            compiler,
            retry,
            metrics,
        })
    }

    pub fn classifier(&self) -> &Arc<ClassifierAdapter> {
        &self.classifier
    }

    pub fn compiler(&self) -> &Arc<ReportCompiler> {
        &self.compiler
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// 执行一次诊断会话
    ///
    /// 取消只在进入 COMPILING 之前生效；编译开始后写入会执行到底。
    pub async fn run(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> std::result::Result<DiagnosticOutcome, DiagnosticError> {
        self.execute(DiagnosticSession::new(), submission, cancel).await
    }

    /// 重新驱动一个失败的会话
    ///
    /// 会话 id 与状态历史保留，尝试次数加一。会话不在 FAILED 时返回
    /// `InvalidStateTransition`，会话原样交还。
    pub async fn retry(
        &self,
        mut session: DiagnosticSession,
        submission: Submission,
        cancel: CancellationToken,
    ) -> std::result::Result<DiagnosticOutcome, DiagnosticError> {
        if let Err(source) = session.restart() {
            return Err(DiagnosticError {
                session_id: session.id(),
                stage: session.state(),
                source,
                session: Box::new(session),
            });
        }
        info!(
            session_id = %session.id(),
            attempt = session.attempt(),
            "Restarting failed diagnostic session"
        );
        self.execute(session, submission, cancel).await
    }

    async fn execute(
        &self,
        mut session: DiagnosticSession,
        submission: Submission,
        cancel: CancellationToken,
    ) -> std::result::Result<DiagnosticOutcome, DiagnosticError> {
        let span = tracing::info_span!(
            "diagnostic_session",
            session_id = %session.id(),
            patient_id = %submission.patient.patient_id
        );

        let result = self
            .drive(&mut session, submission, &cancel)
            .instrument(span)
            .await;

        match result {
            Ok((report, already_reported)) => {
                let outcome = if already_reported {
                    "already_reported"
                } else {
                    "completed"
                };
                self.metrics.record_session(outcome);
                info!(
                    session_id = %session.id(),
                    report_id = %report.id(),
                    level = %report.assessment().level,
                    already_reported,
                    "Diagnostic session complete"
                );
                Ok(DiagnosticOutcome {
                    session,
                    report,
                    already_reported,
                })
            }
            Err(source) => {
                let stage = session.state();
                let outcome = match source {
                    HemaError::Cancelled(_) => "cancelled",
                    _ => "failed",
                };
                self.metrics.record_session(outcome);
                self.metrics.record_stage_failure(stage, source.kind());

                if let Err(e) = session.fail(source.to_string()) {
                    error!(session_id = %session.id(), error = %e, "Session could not enter FAILED");
                }
                match source {
                    HemaError::InvalidInput(_) | HemaError::Cancelled(_) => {
                        warn!(session_id = %session.id(), stage = %stage, error = %source, "Diagnostic session rejected")
                    }
                    _ => {
                        error!(session_id = %session.id(), stage = %stage, error = %source, "Diagnostic session failed")
                    }
                }

                Err(DiagnosticError {
                    session_id: session.id(),
                    stage,
                    source,
                    session: Box::new(session),
                })
            }
        }
    }

    async fn drive(
        &self,
        session: &mut DiagnosticSession,
        submission: Submission,
        cancel: &CancellationToken,
    ) -> Result<(Report, bool)> {
        let Submission {
            patient,
            filename,
            bytes,
        } = submission;
        let sample = Sample::new(patient.patient_id.clone(), filename, bytes)?;
        session.bind_checksum(sample.checksum());
        debug!(checksum = sample.checksum(), size = sample.bytes().len(), "Sample received");

        if let Some(existing) = self.compiler.existing(sample.checksum()).await? {
            session.advance(SessionEvent::AlreadyReported)?;
            warn!(
                checksum = sample.checksum(),
                report_id = %existing.id(),
                "Sample already reported, returning existing report"
            );
            return Ok((existing, true));
        }
        ensure_active(cancel, SessionState::Received)?;

        session.advance(SessionEvent::Start)?;
        let started = Instant::now();
        let preprocessor = Arc::clone(&self.preprocessor);
        let image = sample.shared_bytes();
        let tensor = self
            .blocking(cancel, SessionState::Preprocessing, move || {
                preprocessor.preprocess(&image)
            })
            .await?;
        self.metrics
            .observe_stage(SessionState::Preprocessing, started.elapsed());

        session.advance(SessionEvent::Preprocessed)?;
        let started = Instant::now();
        let inference = self.infer(session, Arc::new(tensor), cancel).await?;
        self.metrics
            .observe_stage(SessionState::Inferring, started.elapsed());

        session.advance(SessionEvent::Inferred)?;
        let started = Instant::now();
        let assessment = self.interpreter.assess(&inference)?;
        self.metrics
            .observe_stage(SessionState::Interpreting, started.elapsed());
        ensure_active(cancel, SessionState::Interpreting)?;

        // 此后不再响应取消
        session.advance(SessionEvent::Interpreted)?;
        let started = Instant::now();
        let compiled = self
            .compiler
            .compile(SampleRecord::from(&sample), patient, inference, assessment)
            .await;
        self.metrics
            .observe_stage(SessionState::Compiling, started.elapsed());

        match compiled {
            Ok(report) => {
                session.advance(SessionEvent::Compiled)?;
                Ok((report, false))
            }
            Err(HemaError::DuplicateReport { existing, .. }) => {
                let report = self.compiler.report(existing).await?;
                session.advance(SessionEvent::AlreadyReported)?;
                warn!(report_id = %existing, "Concurrent session reported this sample first");
                Ok((report, true))
            }
            Err(e) => Err(e),
        }
    }

    /// 推理，瞬时故障按策略重试
    async fn infer(
        &self,
        session: &mut DiagnosticSession,
        tensor: Arc<ImageTensor>,
        cancel: &CancellationToken,
    ) -> Result<hema_core::InferenceResult> {
        let mut retries = 0;
        loop {
            session.record_inference_attempt();
            let classifier = Arc::clone(&self.classifier);
            let input = Arc::clone(&tensor);
            let attempt = self
                .blocking(cancel, SessionState::Inferring, move || {
                    classifier.classify(&input)
                })
                .await;

            match attempt {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && retries < self.retry.max_retries => {
                    retries += 1;
                    let delay = self.retry.backoff(retries);
                    self.metrics.record_inference_retry();
                    warn!(
                        retry = retries,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient inference fault, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(HemaError::Cancelled(format!(
                                "cancelled during {}",
                                SessionState::Inferring
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 在阻塞线程池执行 CPU 密集任务，可被取消
    async fn blocking<T, F>(&self, cancel: &CancellationToken, stage: SessionState, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        ensure_active(cancel, stage)?;
        let handle = tokio::task::spawn_blocking(f);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HemaError::Cancelled(format!("cancelled during {}", stage))),
            joined = handle => joined
                .map_err(|e| HemaError::Internal(format!("{} task failed: {}", stage, e)))?,
        }
    }
}

fn ensure_active(cancel: &CancellationToken, stage: SessionState) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(HemaError::Cancelled(format!("cancelled during {}", stage)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hema_core::{ClassSpec, RiskLevel, RiskPolicy, ThresholdTable, TensorSpec, ChannelFormat};
    use hema_imaging::PreprocessConfig;
    use hema_inference::{BackendError, ModelArtifact, ModelBackend, ModelConfig, ModelLoader};
    use async_trait::async_trait;
    use hema_core::DocumentRef;
    use hema_storage::{DocumentStore, InMemoryReportRepository, ObjectDocumentStore};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use prometheus::Registry;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// 按脚本依次返回结果的后端
    struct ScriptedBackend {
        script: Mutex<VecDeque<std::result::Result<Vec<f32>, BackendError>>>,
        fallback: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl ModelBackend for ScriptedBackend {
        fn forward(&self, _tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    struct ScriptedLoader {
        script: Mutex<Option<VecDeque<std::result::Result<Vec<f32>, BackendError>>>>,
        fallback: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl ModelLoader for ScriptedLoader {
        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>> {
            Ok(Box::new(ScriptedBackend {
                script: Mutex::new(self.script.lock().unwrap().take().unwrap_or_default()),
                fallback: self.fallback.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    struct Harness {
        orchestrator: DiagnosticOrchestrator,
        repository: Arc<InMemoryReportRepository>,
        calls: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn spec() -> TensorSpec {
        TensorSpec {
            height: 32,
            width: 32,
            format: ChannelFormat::Grayscale,
        }
    }

    fn harness(
        output: Vec<f32>,
        script: Vec<std::result::Result<Vec<f32>, BackendError>>,
    ) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(ScriptedLoader {
            script: Mutex::new(Some(script.into())),
            fallback: output,
            calls: calls.clone(),
        });
        build(
            loader,
            Arc::new(ObjectDocumentStore::in_memory()),
            Duration::from_millis(5),
            calls,
        )
    }

    fn build(
        loader: Arc<dyn ModelLoader>,
        documents: Arc<dyn DocumentStore>,
        base_backoff: Duration,
        calls: Arc<AtomicUsize>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.onnx");
        std::fs::write(&model_path, b"weights").unwrap();

        let classifier = ClassifierAdapter::new(
            ModelConfig {
                path: model_path,
                input: spec(),
                labels: vec!["cancerous".to_string(), "benign".to_string()],
                ..Default::default()
            },
            loader,
        )
        .unwrap();

        let interpreter = Arc::new(
            RiskInterpreter::new(RiskPolicy {
                thresholds: ThresholdTable::default(),
                tie_epsilon: 0.05,
                secondary_alert: Some(0.20),
                classes: vec![ClassSpec::malignant("cancerous"), ClassSpec::benign("benign")],
            })
            .unwrap(),
        );
        let repository = Arc::new(InMemoryReportRepository::new());
        let compiler = ReportCompiler::new(interpreter.clone(), documents, repository.clone());
        let preprocessor = ImagePreprocessor::new(PreprocessConfig {
            tensor: spec(),
            ..Default::default()
        })
        .unwrap();

        let orchestrator = DiagnosticOrchestrator::new(
            Arc::new(preprocessor),
            Arc::new(classifier),
            interpreter,
            Arc::new(compiler),
            RetryPolicy {
                max_retries: 1,
                base_backoff,
            },
            Arc::new(PipelineMetrics::new(&Registry::new()).unwrap()),
        )
        .unwrap();

        Harness {
            orchestrator,
            repository,
            calls,
            _dir: dir,
        }
    }

    /// 每次调用先通知测试，再按脚本返回；`delay` 模拟慢推理
    struct GatedBackend {
        script: Mutex<VecDeque<std::result::Result<Vec<f32>, BackendError>>>,
        delay: Duration,
        started: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    }

    impl ModelBackend for GatedBackend {
        fn forward(&self, _tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            std::thread::sleep(self.delay);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![0.92, 0.08]))
        }
    }

    struct GatedLoader {
        script: Mutex<Option<VecDeque<std::result::Result<Vec<f32>, BackendError>>>>,
        delay: Duration,
        started: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    }

    impl ModelLoader for GatedLoader {
        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>> {
            Ok(Box::new(GatedBackend {
                script: Mutex::new(self.script.lock().unwrap().take().unwrap_or_default()),
                delay: self.delay,
                started: self.started.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    fn gated_loader(
        script: Vec<std::result::Result<Vec<f32>, BackendError>>,
        delay: Duration,
        started: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    ) -> Arc<GatedLoader> {
        Arc::new(GatedLoader {
            script: Mutex::new(Some(script.into())),
            delay,
            started,
            calls,
        })
    }

    /// 写入前通知测试并等待一段时间的文档存储
    struct SlowDocuments {
        inner: ObjectDocumentStore,
        started: Arc<Notify>,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowDocuments {
        async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<DocumentRef> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, content, content_type).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    fn cell_png(seed: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(96, 96, |x, y| {
            let v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503).rotate_left(7) ^ seed;
            Luma([(v >> 13) as u8])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn submission(seed: u32) -> Submission {
        Submission::new(PatientInfo::new("PAT001"), "cells.png", cell_png(seed))
    }

    #[tokio::test]
    async fn test_critical_session_completes() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let outcome = h
            .orchestrator
            .run(submission(1), CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.already_reported);
        assert_eq!(outcome.report.assessment().level, RiskLevel::Critical);
        assert_eq!(outcome.session.state(), SessionState::Complete);
        let states: Vec<SessionState> = outcome.session.history().iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Received,
                SessionState::Preprocessing,
                SessionState::Inferring,
                SessionState::Interpreting,
                SessionState::Compiling,
                SessionState::Complete
            ]
        );
        assert_eq!(h.orchestrator.metrics().sessions("completed"), 1);
    }

    #[tokio::test]
    async fn test_transient_fault_then_success() {
        let h = harness(
            vec![0.55, 0.45],
            vec![Err(BackendError::Transient("out of memory".to_string()))],
        );
        let outcome = h
            .orchestrator
            .run(submission(2), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.session.state(), SessionState::Complete);
        assert_eq!(outcome.session.inference_attempts(), 2);
        assert_eq!(outcome.report.assessment().level, RiskLevel::Moderate);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.repository.len().await, 1);
        assert_eq!(h.orchestrator.metrics().inference_retries(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let h = harness(
            vec![0.55, 0.45],
            vec![
                Err(BackendError::Transient("resource exhausted".to_string())),
                Err(BackendError::Transient("resource exhausted".to_string())),
            ],
        );
        let err = h
            .orchestrator
            .run(submission(3), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage, SessionState::Inferring);
        assert!(matches!(err.source, HemaError::Inference { transient: true, .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(h.repository.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_transient_fault_is_not_retried() {
        let h = harness(
            vec![0.55, 0.45],
            vec![Err(BackendError::Shape("bad dims".to_string()))],
        );
        let err = h
            .orchestrator
            .run(submission(4), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage, SessionState::Inferring);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_session_can_be_retried() {
        let h = harness(
            vec![0.92, 0.08],
            vec![Err(BackendError::Shape("bad dims".to_string()))],
        );
        let err = h
            .orchestrator
            .run(submission(12), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.session.state(), SessionState::Failed);
        assert_eq!(err.session.failure().unwrap().stage, SessionState::Inferring);
        let session_id = err.session_id;

        let outcome = h
            .orchestrator
            .retry(*err.session, submission(12), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.session.id(), session_id);
        assert_eq!(outcome.session.attempt(), 2);
        assert_eq!(outcome.session.inference_attempts(), 1);
        assert_eq!(outcome.session.state(), SessionState::Complete);
        assert!(!outcome.already_reported);
        let states: Vec<SessionState> = outcome.session.history().iter().map(|r| r.state).collect();
        assert_eq!(states.iter().filter(|s| **s == SessionState::Failed).count(), 1);
        assert_eq!(states.iter().filter(|s| **s == SessionState::Received).count(), 2);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_retry_rejects_session_that_did_not_fail() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let outcome = h
            .orchestrator
            .run(submission(13), CancellationToken::new())
            .await
            .unwrap();

        let err = h
            .orchestrator
            .retry(outcome.session, submission(13), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.source, HemaError::InvalidStateTransition { .. }));
        assert_eq!(err.stage, SessionState::Complete);
        assert_eq!(err.session.attempt(), 1);
        assert_eq!(h.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_before_model() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let bad = Submission::new(PatientInfo::new("PAT001"), "notes.txt", vec![b'x'; 500]);
        let err = h
            .orchestrator
            .run(bad, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage, SessionState::Preprocessing);
        assert!(matches!(err.source, HemaError::InvalidInput(_)));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(!h.orchestrator.classifier().is_loaded());
    }

    #[tokio::test]
    async fn test_empty_patient_is_rejected_at_intake() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let err = h
            .orchestrator
            .run(
                Submission::new(PatientInfo::new(""), "cells.png", cell_png(5)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage, SessionState::Received);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let first = h
            .orchestrator
            .run(submission(6), CancellationToken::new())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .run(submission(6), CancellationToken::new())
            .await
            .unwrap();

        assert!(second.already_reported);
        assert_eq!(second.report.id(), first.report.id());
        assert_eq!(
            second.session.history().last().map(|r| r.state),
            Some(SessionState::Complete)
        );
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_yield_one_report() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let orchestrator = h.orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.run(submission(7), CancellationToken::new()).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().report.id());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.orchestrator.run(submission(8), cancel).await.unwrap_err();
        assert!(matches!(err.source, HemaError::Cancelled(_)));
        assert!(h.repository.is_empty().await);
        assert_eq!(h.orchestrator.metrics().sessions("cancelled"), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_inference() {
        let started = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = gated_loader(vec![], Duration::from_millis(500), started.clone(), calls.clone());
        let h = build(
            loader,
            Arc::new(ObjectDocumentStore::in_memory()),
            Duration::from_millis(5),
            calls,
        );

        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator.clone();
        let token = cancel.clone();
        let session = tokio::spawn(async move { orchestrator.run(submission(9), token).await });

        started.notified().await;
        cancel.cancel();
        let err = session.await.unwrap().unwrap_err();

        assert_eq!(err.stage, SessionState::Inferring);
        assert!(matches!(err.source, HemaError::Cancelled(_)));
        assert!(h.repository.is_empty().await);
        assert_eq!(h.orchestrator.metrics().sessions("cancelled"), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff() {
        let started = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = gated_loader(
            vec![Err(BackendError::Transient("device busy".to_string()))],
            Duration::ZERO,
            started.clone(),
            calls.clone(),
        );
        let h = build(
            loader,
            Arc::new(ObjectDocumentStore::in_memory()),
            Duration::from_secs(30),
            calls,
        );

        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator.clone();
        let token = cancel.clone();
        let session = tokio::spawn(async move { orchestrator.run(submission(10), token).await });

        started.notified().await;
        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("backoff sleep should observe cancellation")
            .unwrap()
            .unwrap_err();

        assert_eq!(err.stage, SessionState::Inferring);
        assert!(matches!(err.source, HemaError::Cancelled(_)));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.repository.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_during_compiling_still_persists() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model_started = Arc::new(Notify::new());
        let loader = gated_loader(vec![], Duration::ZERO, model_started, calls.clone());
        let write_started = Arc::new(Notify::new());
        let documents = Arc::new(SlowDocuments {
            inner: ObjectDocumentStore::in_memory(),
            started: write_started.clone(),
            delay: Duration::from_millis(200),
        });
        let h = build(loader, documents, Duration::from_millis(5), calls);

        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator.clone();
        let token = cancel.clone();
        let session = tokio::spawn(async move { orchestrator.run(submission(11), token).await });

        write_started.notified().await;
        cancel.cancel();
        let outcome = session.await.unwrap().unwrap();

        assert_eq!(outcome.session.state(), SessionState::Complete);
        assert!(!outcome.already_reported);
        assert_eq!(h.repository.len().await, 1);
        let stored = h
            .orchestrator
            .compiler()
            .document(outcome.report.id())
            .await
            .unwrap();
        assert_eq!(stored.len() as u64, outcome.report.document().size_bytes);
    }

    #[tokio::test]
    async fn test_mismatched_labels_are_rejected() {
        let h = harness(vec![0.92, 0.08], vec![]);
        let interpreter = Arc::new(RiskInterpreter::new(RiskPolicy::default()).unwrap());
        let result = DiagnosticOrchestrator::new(
            h.orchestrator.preprocessor.clone(),
            h.orchestrator.classifier.clone(),
            interpreter,
            h.orchestrator.compiler.clone(),
            RetryPolicy::default(),
            h.orchestrator.metrics.clone(),
        );
        assert!(matches!(result, Err(HemaError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }
}
