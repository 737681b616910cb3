//! HemaBridge 服务器主程序

use anyhow::{Context, Result};
use clap::Parser;
use hema_admin::{init_logging, ConfigManager, SystemMonitor};
use hema_inference::ModelLoader;
use hema_web::{AppState, WebServer, WebServerConfig};
use hemabridge::{assemble, open_repository};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// HemaBridge 服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "hema-server")]
#[command(about = "HemaBridge 血细胞影像诊断服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 服务器端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 只校验配置后退出
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::new(args.config.as_deref())?;
    let mut config = manager.get_config().await;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    manager.update_config(config.clone()).await?;

    init_logging(&config.logging)?;

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting HemaBridge server...");
    info!("  Bind address: {}", config.bind_address());
    info!("  Model: {}", config.model.path.display());
    info!("  Model classes: {}", config.model.classes.len());

    let repository = open_repository(&config)
        .await
        .context("Failed to open report repository")?;
    let pipeline = assemble(&config, model_loader(), repository)
        .context("Failed to assemble diagnostic pipeline")?;
    let monitor = Arc::new(SystemMonitor::new(pipeline.registry.clone())?);
    let classifier = pipeline.orchestrator.classifier().clone();

    if config.model.warm_up {
        let version = classifier.warm_up().context("Model warm-up failed")?;
        info!("Model warmed up: {}", version);
    } else {
        warn!("Model warm-up disabled, first request will load the model");
    }

    let addr: std::net::SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;
    let server = WebServer::new(
        WebServerConfig {
            addr,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            max_body_bytes: config.preprocessing.max_bytes,
        },
        AppState::new(pipeline.orchestrator, monitor),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let result = server.run(shutdown).await;
    classifier.teardown();
    info!("HemaBridge server stopped");
    result
}

#[cfg(feature = "onnx")]
fn model_loader() -> Arc<dyn ModelLoader> {
    Arc::new(hema_inference::OnnxLoader)
}

#[cfg(not(feature = "onnx"))]
fn model_loader() -> Arc<dyn ModelLoader> {
    Arc::new(UnavailableLoader)
}

/// 未启用推理后端时使用，任何加载都返回模型不可用
#[cfg(not(feature = "onnx"))]
struct UnavailableLoader;

#[cfg(not(feature = "onnx"))]
impl ModelLoader for UnavailableLoader {
    fn load(
        &self,
        artifact: &hema_inference::ModelArtifact,
    ) -> hema_core::Result<Box<dyn hema_inference::ModelBackend>> {
        Err(hema_core::HemaError::ModelUnavailable(format!(
            "{}: hema-server was built without the `onnx` feature",
            artifact.path().display()
        )))
    }
}
