//! 按配置组装诊断流水线

use hema_admin::{HemaConfig, RepositoryBackend};
use hema_core::{HemaError, Result};
use hema_imaging::ImagePreprocessor;
use hema_inference::{ClassifierAdapter, ModelLoader};
use hema_report::{ReportCompiler, ReviewDesk};
use hema_risk::RiskInterpreter;
use hema_storage::{DocumentStore, InMemoryReportRepository, ObjectDocumentStore, ReportRepository};
use hema_workflow::{DiagnosticOrchestrator, PipelineMetrics};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{info, warn};

/// 组装好的流水线
#[derive(Clone)]
pub struct Pipeline {
    pub orchestrator: DiagnosticOrchestrator,
    pub review: ReviewDesk,
    pub registry: Registry,
}

/// 按配置创建流水线的全部组件
///
/// 报告库由调用方提供（见 [`open_repository`]），文档存储按 `storage.documents` 打开。
/// 服务器、演示程序和端到端测试都经由这里组装。
pub fn assemble(
    config: &HemaConfig,
    loader: Arc<dyn ModelLoader>,
    repository: Arc<dyn ReportRepository>,
) -> Result<Pipeline> {
    let registry = Registry::new();
    let metrics = Arc::new(PipelineMetrics::new(&registry)?);

    let documents: Arc<dyn DocumentStore> =
        Arc::new(ObjectDocumentStore::from_config(&config.storage.documents)?);
    let interpreter = Arc::new(RiskInterpreter::new(config.risk_policy())?);
    let classifier = Arc::new(ClassifierAdapter::new(config.model_config(), loader)?);
    let preprocessor = Arc::new(ImagePreprocessor::new(config.preprocess_config())?);
    let compiler = Arc::new(ReportCompiler::new(
        interpreter.clone(),
        documents,
        repository.clone(),
    ));

    let orchestrator = DiagnosticOrchestrator::new(
        preprocessor,
        classifier,
        interpreter,
        compiler,
        config.retry_policy(),
        metrics,
    )?;

    info!(
        model = %config.model.path.display(),
        classes = config.model.classes.len(),
        "Diagnostic pipeline assembled"
    );

    Ok(Pipeline {
        orchestrator,
        review: ReviewDesk::new(repository),
        registry,
    })
}

/// 按 `storage.repository` 打开报告库
pub async fn open_repository(config: &HemaConfig) -> Result<Arc<dyn ReportRepository>> {
    match config.storage.repository {
        RepositoryBackend::Memory => {
            warn!("Using in-memory report repository, reports are lost on restart");
            Ok(Arc::new(InMemoryReportRepository::new()))
        }
        RepositoryBackend::Postgres => postgres_repository(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_repository(config: &HemaConfig) -> Result<Arc<dyn ReportRepository>> {
    let url = config.storage.database_url.as_deref().ok_or_else(|| {
        HemaError::Config("storage.database_url is required for the postgres repository".to_string())
    })?;
    let repository =
        hema_storage::PgReportRepository::connect(url, config.storage.max_connections).await?;
    repository.create_tables().await?;
    info!("Connected to PostgreSQL report repository");
    Ok(Arc::new(repository))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_repository(_config: &HemaConfig) -> Result<Arc<dyn ReportRepository>> {
    Err(HemaError::Config(
        "postgres repository requested but built without the `postgres` feature".to_string(),
    ))
}
