//! Web服务器

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use hema_admin::SystemMonitor;
use hema_report::ReviewDesk;
use hema_workflow::DiagnosticOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{
    api_root, archive_report, get_patient_reports, get_patient_summary, get_report,
    get_report_by_checksum, get_report_document, health, metrics, review_report, submit_sample,
};

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: DiagnosticOrchestrator,
    pub review: ReviewDesk,
    pub monitor: Arc<SystemMonitor>,
    /// 服务关闭时取消所有尚未进入编译阶段的会话
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: DiagnosticOrchestrator, monitor: Arc<SystemMonitor>) -> Self {
        let review = ReviewDesk::new(orchestrator.compiler().repository().clone());
        Self {
            orchestrator,
            review,
            monitor,
            shutdown: CancellationToken::new(),
        }
    }
}

/// HTTP 层限制
#[derive(Debug, Clone, Copy)]
pub struct WebServerConfig {
    pub addr: SocketAddr,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
}

impl WebServer {
    pub fn new(config: WebServerConfig, state: AppState) -> Self {
        let shutdown = state.shutdown.clone();
        let app = create_app(state, config.request_timeout, config.max_body_bytes);

        Self {
            addr: config.addr,
            app,
            shutdown,
        }
    }

    /// 运行直到 `shutdown` 被触发
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let sessions = self.shutdown;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutting down web server");
                sessions.cancel();
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        Ok(())
    }
}

/// 构建路由与全局中间件
pub fn create_app(state: AppState, request_timeout: Duration, max_body_bytes: usize) -> Router {
    Router::new()
        // 根路径
        .route("/", get(api_root))

        // 健康检查与指标
        .route("/health", get(health))
        .route("/metrics", get(metrics))

        // API路由
        .nest("/api/v1", api_routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), track_http))
        .with_state(state)

        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(TimeoutLayer::new(request_timeout))
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(api_root))
        .route("/samples", post(submit_sample))
        .route("/reports/by-checksum/:checksum", get(get_report_by_checksum))
        .route("/reports/:id", get(get_report))
        .route("/reports/:id/document", get(get_report_document))
        .route("/reports/:id/review", post(review_report))
        .route("/reports/:id/archive", post(archive_report))
        .route("/patients/:patient_id/reports", get(get_patient_reports))
        .route("/patients/:patient_id/summary", get(get_patient_summary))
}

/// 按匹配的路由模板记录请求数和耗时
async fn track_http(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    state.monitor.record_http_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
