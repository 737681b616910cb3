//! 配置管理
//!
//! 默认值 → 可选的 TOML 配置文件 → `HEMA_*` 环境变量，逐层覆盖后统一校验

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use hema_core::{ChannelFormat, ClassSpec, RiskPolicy, TensorSpec, ThresholdTable};
use hema_imaging::{ImageEncoding, PreprocessConfig};
use hema_inference::{ModelConfig, OutputActivation};
use hema_storage::DocumentStoreConfig;
use hema_workflow::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<HemaConfig>>,
    config_path: Option<PathBuf>,
    validator: ConfigValidator,
}

/// HemaBridge 完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HemaConfig {
    pub server: ServerConfig,
    pub model: ModelSection,
    pub preprocessing: PreprocessingSection,
    pub risk: RiskSection,
    pub retry: RetrySection,
    pub storage: StorageSection,
    pub logging: LoggingConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

/// 分类模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub path: PathBuf,
    pub version_label: String,
    pub input_height: u32,
    pub input_width: u32,
    pub channels: ChannelFormat,
    /// 输出类别，顺序与模型输出一致；同时作为风险策略的类别表
    pub classes: Vec<ClassSpec>,
    pub activation: OutputActivation,
    pub intra_threads: usize,
    /// 启动时加载模型
    pub warm_up: bool,
}

/// 影像预处理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingSection {
    pub min_width: u32,
    pub min_height: u32,
    pub max_bytes: usize,
    pub allowed_encodings: Vec<ImageEncoding>,
}

/// 风险阈值配置
///
/// 默认值是占位值，需经临床确认后替换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSection {
    pub moderate: f32,
    pub high: f32,
    pub critical: f32,
    pub tie_epsilon: f32,
    pub secondary_alert: Option<f32>,
}

/// 推理重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

/// 报告记录存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    Memory,
    Postgres,
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub documents: DocumentStoreConfig,
    pub repository: RepositoryBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` 语法，如 `info,hema_workflow=debug`
    pub level: String,
    pub format: LogFormat,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&HemaConfig) -> Result<()>,
}

impl HemaConfig {
    pub fn tensor_spec(&self) -> TensorSpec {
        TensorSpec {
            height: self.model.input_height,
            width: self.model.input_width,
            format: self.model.channels,
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            path: self.model.path.clone(),
            version_label: self.model.version_label.clone(),
            input: self.tensor_spec(),
            labels: self.model.classes.iter().map(|c| c.label.clone()).collect(),
            activation: self.model.activation,
            intra_threads: self.model.intra_threads,
        }
    }

    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            tensor: self.tensor_spec(),
            min_width: self.preprocessing.min_width,
            min_height: self.preprocessing.min_height,
            max_bytes: self.preprocessing.max_bytes,
            allowed_encodings: self.preprocessing.allowed_encodings.clone(),
        }
    }

    pub fn risk_policy(&self) -> RiskPolicy {
        RiskPolicy {
            thresholds: ThresholdTable {
                moderate: self.risk.moderate,
                high: self.risk.high,
                critical: self.risk.critical,
            },
            tie_epsilon: self.risk.tie_epsilon,
            secondary_alert: self.risk.secondary_alert,
            classes: self.model.classes.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ConfigManager {
    /// 加载并校验配置
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        Self::from_config(config, config_path.map(Path::to_path_buf))
    }

    /// 使用已有配置创建管理器
    pub fn from_config(config: HemaConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            validator,
        })
    }

    fn load_config(config_path: Option<&Path>) -> Result<HemaConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("HEMA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: HemaConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    pub async fn get_config(&self) -> HemaConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, new_config: HemaConfig) -> Result<()> {
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;
        info!("Configuration updated successfully");
        Ok(())
    }

    /// 重新读取配置文件与环境变量
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(self.config_path.as_deref())?;
        self.update_config(new_config).await
    }

    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    anyhow::ensure!(config.server.port != 0, "Server port cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "model.classes",
                validator: |config| {
                    anyhow::ensure!(!config.model.classes.is_empty(), "At least one class is required");
                    let mut seen = HashSet::new();
                    for class in &config.model.classes {
                        anyhow::ensure!(
                            seen.insert(class.label.as_str()),
                            "Duplicate class label: {}",
                            class.label
                        );
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "model",
                validator: |config| {
                    anyhow::ensure!(
                        config.model.input_height > 0 && config.model.input_width > 0,
                        "Model input size must be positive"
                    );
                    config.model_config().validate()?;
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "preprocessing",
                validator: |config| {
                    anyhow::ensure!(
                        !config.preprocessing.allowed_encodings.is_empty(),
                        "At least one image encoding must be allowed"
                    );
                    anyhow::ensure!(config.preprocessing.max_bytes > 0, "max_bytes must be positive");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "risk",
                validator: |config| {
                    config.risk_policy().validate()?;
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "retry",
                validator: |config| {
                    anyhow::ensure!(config.retry.max_retries <= 5, "At most 5 inference retries are allowed");
                    anyhow::ensure!(config.retry.backoff_ms > 0, "Retry backoff must be positive");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "storage",
                validator: |config| {
                    if config.storage.repository == RepositoryBackend::Postgres {
                        anyhow::ensure!(
                            config.storage.database_url.as_deref().is_some_and(|u| !u.is_empty()),
                            "database_url is required for the postgres repository"
                        );
                        anyhow::ensure!(config.storage.max_connections > 0, "max_connections cannot be 0");
                    }
                    if let DocumentStoreConfig::S3 { bucket } = &config.storage.documents {
                        anyhow::ensure!(!bucket.is_empty(), "S3 bucket name cannot be empty");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "logging.level",
                validator: |config| {
                    tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                        .with_context(|| format!("Invalid log filter: {}", config.logging.level))?;
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &HemaConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid configuration at {}", rule.field_path)));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 60,
        }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            path: model.path,
            version_label: model.version_label,
            input_height: model.input.height,
            input_width: model.input.width,
            channels: model.input.format,
            classes: ClassSpec::blood_cell_classes(),
            activation: model.activation,
            intra_threads: model.intra_threads,
            warm_up: true,
        }
    }
}

impl Default for PreprocessingSection {
    fn default() -> Self {
        let defaults = PreprocessConfig::default();
        Self {
            min_width: defaults.min_width,
            min_height: defaults.min_height,
            max_bytes: defaults.max_bytes,
            allowed_encodings: defaults.allowed_encodings,
        }
    }
}

impl Default for RiskSection {
    fn default() -> Self {
        let policy = RiskPolicy::default();
        Self {
            moderate: policy.thresholds.moderate,
            high: policy.thresholds.high,
            critical: policy.thresholds.critical,
            tie_epsilon: policy.tie_epsilon,
            secondary_alert: policy.secondary_alert,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            backoff_ms: policy.base_backoff.as_millis() as u64,
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            documents: DocumentStoreConfig::default(),
            repository: RepositoryBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
