//! 报告文档存储

use async_trait::async_trait;
use bytes::Bytes;
use hema_core::utils::sha256_hex;
use hema_core::{DocumentRef, HemaError, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// 文档存储接口
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 写入文档，返回引用（含大小与摘要）
    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<DocumentRef>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// 文档存储后端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DocumentStoreConfig {
    /// 仅用于测试和演示
    Memory,
    Local { root: PathBuf },
    /// 凭证从标准 AWS 环境变量读取
    S3 { bucket: String },
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        DocumentStoreConfig::Local {
            root: PathBuf::from("./data/reports"),
        }
    }
}

/// 基于 `object_store` 的文档存储
#[derive(Debug, Clone)]
pub struct ObjectDocumentStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectDocumentStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn local(root: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| HemaError::Storage(format!("cannot open {}: {}", root.display(), e)))?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn s3(bucket: &str) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| HemaError::Storage(format!("cannot open bucket {}: {}", bucket, e)))?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn from_config(config: &DocumentStoreConfig) -> Result<Self> {
        match config {
            DocumentStoreConfig::Memory => Ok(Self::in_memory()),
            DocumentStoreConfig::Local { root } => Self::local(root),
            DocumentStoreConfig::S3 { bucket } => Self::s3(bucket),
        }
    }

    fn path(key: &str) -> Result<ObjectPath> {
        ObjectPath::parse(key).map_err(|e| HemaError::Storage(format!("invalid document key {}: {}", key, e)))
    }
}

fn map_store_error(key: &str, err: object_store::Error) -> HemaError {
    match err {
        object_store::Error::NotFound { .. } => HemaError::NotFound(format!("document {}", key)),
        other => HemaError::Storage(other.to_string()),
    }
}

#[async_trait]
impl DocumentStore for ObjectDocumentStore {
    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<DocumentRef> {
        let path = Self::path(key)?;
        let document = DocumentRef {
            key: key.to_string(),
            size_bytes: content.len() as u64,
            sha256: sha256_hex(&content),
            content_type: content_type.to_string(),
        };

        self.store
            .put(&path, Bytes::from(content))
            .await
            .map_err(|e| map_store_error(key, e))?;

        debug!(key, size = document.size_bytes, "Document stored");
        Ok(document)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = Self::path(key)?;
        let bytes = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_store_error(key, e))?
            .bytes()
            .await
            .map_err(|e| map_store_error(key, e))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Self::path(key)?;
        self.store
            .delete(&path)
            .await
            .map_err(|e| map_store_error(key, e))
    }
}
