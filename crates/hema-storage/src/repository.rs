//! 报告记录存储

use async_trait::async_trait;
use chrono::Utc;
use hema_core::{HemaError, Report, Result, ReviewAction};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// 插入结果
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// 同一校验和已有报告，返回已有报告
    Duplicate(Report),
}

/// 报告记录存储接口
///
/// 实现必须保证同一样本校验和最多只有一条报告。
#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Report>>;

    async fn get(&self, id: Uuid) -> Result<Option<Report>>;

    /// 原子地插入报告，校验和已存在时不写入
    async fn insert_if_absent(&self, report: &Report) -> Result<InsertOutcome>;

    /// 按生成时间升序返回患者的全部报告
    async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<Report>>;

    /// 应用审核动作，返回更新后的报告
    async fn apply_review(&self, id: Uuid, action: ReviewAction, actor: &str) -> Result<Report>;
}

#[derive(Debug, Default)]
struct Tables {
    reports: HashMap<Uuid, Report>,
    by_checksum: HashMap<String, Uuid>,
}

/// 内存报告存储
#[derive(Debug, Default)]
pub struct InMemoryReportRepository {
    tables: RwLock<Tables>,
}

impl InMemoryReportRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.reports.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ReportRepository for InMemoryReportRepository {
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Report>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_checksum
            .get(checksum)
            .and_then(|id| tables.reports.get(id))
            .cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Report>> {
        Ok(self.tables.read().await.reports.get(&id).cloned())
    }

    async fn insert_if_absent(&self, report: &Report) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let checksum = report.sample().checksum.clone();

        if let Some(existing) = tables
            .by_checksum
            .get(&checksum)
            .and_then(|id| tables.reports.get(id))
        {
            debug!(checksum = %checksum, existing = %existing.id(), "Report already exists");
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        if tables.reports.contains_key(&report.id()) {
            return Err(HemaError::Storage(format!("report id {} already used", report.id())));
        }

        tables.by_checksum.insert(checksum, report.id());
        tables.reports.insert(report.id(), report.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<Report>> {
        let tables = self.tables.read().await;
        let mut reports: Vec<Report> = tables
            .reports
            .values()
            .filter(|r| r.patient().patient_id == patient_id)
            .cloned()
            .collect();
        reports.sort_by(|a, b| a.generated_at().cmp(&b.generated_at()).then(a.id().cmp(&b.id())));
        Ok(reports)
    }

    async fn apply_review(&self, id: Uuid, action: ReviewAction, actor: &str) -> Result<Report> {
        let mut tables = self.tables.write().await;
        let report = tables
            .reports
            .get_mut(&id)
            .ok_or_else(|| HemaError::NotFound(format!("report {}", id)))?;
        report.apply_review(action, actor, Utc::now())?;
        Ok(report.clone())
    }
}
