//! PostgreSQL 报告存储

use crate::repository::{InsertOutcome, ReportRepository};
use async_trait::async_trait;
use chrono::Utc;
use hema_core::{HemaError, Report, Result, ReviewAction};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL 报告存储
///
/// 报告整体以 JSONB 保存，校验和列上的唯一约束保证幂等。
#[derive(Debug, Clone)]
pub struct PgReportRepository {
    pool: PgPool,
}

impl PgReportRepository {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        tracing::info!("Connected to report database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id UUID PRIMARY KEY,
                checksum VARCHAR(64) UNIQUE NOT NULL,
                patient_id VARCHAR(64) NOT NULL,
                risk_level VARCHAR(16) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'PENDING_REVIEW',
                generated_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                body JSONB NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_reports_patient_id ON reports(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_reports_generated_at ON reports(generated_at)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        tracing::info!("Report tables created successfully");
        Ok(())
    }
}

fn decode(row: &PgRow) -> Result<Report> {
    let Json(report): Json<Report> = row.try_get("body")?;
    Ok(report)
}

#[async_trait]
impl ReportRepository for PgReportRepository {
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Report>> {
        let row = sqlx::query("SELECT body FROM reports WHERE checksum = $1")
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Report>> {
        let row = sqlx::query("SELECT body FROM reports WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert_if_absent(&self, report: &Report) -> Result<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO reports (id, checksum, patient_id, risk_level, status, generated_at, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (checksum) DO NOTHING
        "#,
        )
        .bind(report.id())
        .bind(report.checksum())
        .bind(&report.patient().patient_id)
        .bind(report.assessment().level.as_str())
        .bind(report.status().as_str())
        .bind(report.generated_at())
        .bind(Json(report))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        match self.find_by_checksum(report.checksum()).await? {
            Some(existing) => Ok(InsertOutcome::Duplicate(existing)),
            None => Err(HemaError::Storage(format!(
                "insert of report {} was rejected without a conflicting row",
                report.id()
            ))),
        }
    }

    async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT body FROM reports WHERE patient_id = $1 ORDER BY generated_at ASC, id ASC",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    async fn apply_review(&self, id: Uuid, action: ReviewAction, actor: &str) -> Result<Report> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body FROM reports WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| HemaError::NotFound(format!("report {}", id)))?;
        let mut report = decode(&row)?;

        let status = report.apply_review(action, actor, Utc::now())?;

        sqlx::query("UPDATE reports SET status = $1, body = $2, updated_at = NOW() WHERE id = $3")
            .bind(status.as_str())
            .bind(Json(&report))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(report_id = %id, status = %status, actor, "Report review updated");
        Ok(report)
    }
}
