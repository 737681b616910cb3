//! HTTP处理器

use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use hema_admin::ComponentHealth;
use hema_admin::HealthLevel;
use hema_core::{HemaError, PatientInfo, Report};
use hema_workflow::{DiagnosticError, DiagnosticOutcome, Submission};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "HemaBridge Diagnostic API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "metrics": "/metrics",
            "api": "/api/v1"
        }
    }))
}

/// 健康检查处理器
pub async fn health(State(state): State<AppState>) -> Response {
    let classifier = state.orchestrator.classifier();
    let model = match classifier.version() {
        Some(version) => ComponentHealth::healthy(format!("loaded {}", version)),
        None => ComponentHealth::degraded("model not loaded"),
    };

    let mut components = HashMap::new();
    components.insert("model".to_string(), model);

    let health = state.monitor.health_status(components);
    let status = match health.status {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(health)).into_response()
}

/// Prometheus 指标导出
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.monitor.get_prometheus_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// 上传参数
#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub patient_id: String,
    pub filename: Option<String>,
    pub patient_name: Option<String>,
    pub age: Option<u32>,
}

/// 审阅请求体
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewer: String,
}

/// 报告摘要，API 返回给调用方
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub report_id: Uuid,
    pub sample_id: Uuid,
    pub checksum: String,
    pub patient_id: String,
    pub risk_level: String,
    pub headline: String,
    pub confidence: f32,
    pub top_class: String,
    pub findings: Vec<String>,
    pub model_version: String,
    pub review_status: String,
    pub generated_at: DateTime<Utc>,
    pub document_url: String,
}

impl From<&Report> for ReportSummary {
    fn from(report: &Report) -> Self {
        let assessment = report.assessment();
        Self {
            report_id: report.id(),
            sample_id: report.sample().sample_id,
            checksum: report.checksum().to_string(),
            patient_id: report.patient().patient_id.clone(),
            risk_level: assessment.level.to_string(),
            headline: assessment.headline(),
            confidence: assessment.confidence,
            top_class: assessment.top_class.clone(),
            findings: assessment.findings.clone(),
            model_version: report.inference().model_version().to_string(),
            review_status: report.status().to_string(),
            generated_at: report.generated_at(),
            document_url: format!("/api/v1/reports/{}/document", report.id()),
        }
    }
}

/// 上传结果：会话信息加报告摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub session_id: Uuid,
    pub state: String,
    pub attempt: u32,
    pub inference_attempts: u32,
    pub already_reported: bool,
    pub report: ReportSummary,
}

impl From<&DiagnosticOutcome> for SubmissionResponse {
    fn from(outcome: &DiagnosticOutcome) -> Self {
        Self {
            session_id: outcome.session.id(),
            state: outcome.session.state().to_string(),
            attempt: outcome.session.attempt(),
            inference_attempts: outcome.session.inference_attempts(),
            already_reported: outcome.already_reported,
            report: ReportSummary::from(&outcome.report),
        }
    }
}

/// 上传样本并执行诊断会话
///
/// 会话在独立任务中运行；请求被丢弃时取消令牌触发，但编译一旦开始会执行到底。
pub async fn submit_sample(
    State(state): State<AppState>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    let filename = params
        .filename
        .unwrap_or_else(|| "upload.png".to_string());
    info!(
        patient_id = %params.patient_id,
        filename = %filename,
        size = body.len(),
        "Received sample upload"
    );

    let patient = PatientInfo {
        patient_id: params.patient_id,
        name: params.patient_name,
        age: params.age,
    };
    let submission = Submission::new(patient, filename, body.to_vec());

    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run(submission, cancel).await });

    let result = handle
        .await
        .map_err(|e| ApiError::from(HemaError::Internal(format!("session task failed: {}", e))))?;
    guard.disarm();

    let outcome = result?;
    let status = if outcome.already_reported {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(SubmissionResponse::from(&outcome))))
}

/// 按报告ID获取完整报告
pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Report>, ApiError> {
    let report = state.orchestrator.compiler().report(id).await?;
    Ok(Json(report))
}

/// 下载报告 PDF
pub async fn get_report_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let bytes = state.orchestrator.compiler().document(id).await?;
    Ok(pdf_response(bytes, &format!("report_{}.pdf", id)))
}

/// 按样本校验和查找报告
pub async fn get_report_by_checksum(
    State(state): State<AppState>,
    Path(checksum): Path<String>,
) -> Result<Json<ReportSummary>, ApiError> {
    let report = state
        .orchestrator
        .compiler()
        .existing(&checksum)
        .await?
        .ok_or_else(|| HemaError::NotFound(format!("no report for sample {}", checksum)))?;
    Ok(Json(ReportSummary::from(&report)))
}

/// 患者的全部报告，按生成时间排序
pub async fn get_patient_reports(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reports = state
        .orchestrator
        .compiler()
        .reports_for_patient(&patient_id)
        .await?;
    let summaries: Vec<ReportSummary> = reports.iter().map(ReportSummary::from).collect();

    Ok(Json(json!({
        "patient_id": patient_id,
        "total": summaries.len(),
        "reports": summaries,
    })))
}

/// 患者汇总报告 PDF
pub async fn get_patient_summary(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .orchestrator
        .compiler()
        .patient_summary(&patient_id)
        .await?;
    Ok(pdf_response(bytes, &format!("summary_{}.pdf", patient_id)))
}

/// 标记报告为已审阅
pub async fn review_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReportSummary>, ApiError> {
    let report = state.review.mark_reviewed(id, &request.reviewer).await?;
    Ok(Json(ReportSummary::from(&report)))
}

/// 归档报告
pub async fn archive_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReportSummary>, ApiError> {
    let report = state.review.archive(id, &request.reviewer).await?;
    Ok(Json(ReportSummary::from(&report)))
}

fn pdf_response(bytes: Vec<u8>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// API 错误响应
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    session_id: Option<Uuid>,
    stage: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// 错误类型到 HTTP 状态码的映射
pub fn status_for(error: &HemaError) -> StatusCode {
    match error {
        HemaError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        HemaError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HemaError::Inference { .. } => StatusCode::BAD_GATEWAY,
        HemaError::DuplicateReport { .. } => StatusCode::CONFLICT,
        HemaError::NotFound(_) => StatusCode::NOT_FOUND,
        HemaError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        HemaError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        HemaError::Storage(_)
        | HemaError::Config(_)
        | HemaError::Serialization(_)
        | HemaError::Io(_)
        | HemaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<HemaError> for ApiError {
    fn from(error: HemaError) -> Self {
        Self {
            status: status_for(&error),
            kind: error.kind(),
            message: error.to_string(),
            session_id: None,
            stage: None,
        }
    }
}

impl From<DiagnosticError> for ApiError {
    fn from(error: DiagnosticError) -> Self {
        Self {
            status: status_for(&error.source),
            kind: error.source.kind(),
            message: error.source.to_string(),
            session_id: Some(error.session_id),
            stage: Some(error.stage.to_string()),
        }
    }
}

/// 错误处理
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, status = self.status.as_u16(), "{}", self.message);
        } else {
            warn!(kind = self.kind, status = self.status.as_u16(), "{}", self.message);
        }

        let body = Json(json!({
            "error": true,
            "kind": self.kind,
            "message": self.message,
            "status": self.status.as_u16(),
            "session_id": self.session_id,
            "stage": self.stage,
        }));

        (self.status, body).into_response()
    }
}
