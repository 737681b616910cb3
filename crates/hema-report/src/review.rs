//! 报告审阅台
//!
//! 报告生成后只允许审阅状态变化：PENDING_REVIEW → REVIEWED → ARCHIVED。

use hema_core::{Report, Result, ReviewAction};
use hema_storage::ReportRepository;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct ReviewDesk {
    repository: Arc<dyn ReportRepository>,
}

impl ReviewDesk {
    pub fn new(repository: Arc<dyn ReportRepository>) -> Self {
        Self { repository }
    }

    /// 标记为已审阅
    pub async fn mark_reviewed(&self, report_id: Uuid, reviewer: &str) -> Result<Report> {
        self.apply(report_id, ReviewAction::MarkReviewed, reviewer).await
    }

    /// 归档，仅允许已审阅的报告
    pub async fn archive(&self, report_id: Uuid, reviewer: &str) -> Result<Report> {
        self.apply(report_id, ReviewAction::Archive, reviewer).await
    }

    async fn apply(&self, report_id: Uuid, action: ReviewAction, reviewer: &str) -> Result<Report> {
        let report = self.repository.apply_review(report_id, action, reviewer).await?;
        info!(
            report_id = %report_id,
            status = %report.status(),
            reviewer,
            "Report review status updated"
        );
        Ok(report)
    }
}
