//! 批量作业模型与仓储

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use notify_shared::error::Result;
use notify_shared::messages::{Channel, JobMessage, JobStatus};

use crate::recipients::RecipientFilter;

const JOB_COLUMNS: &str = "id, channel, subject, content, variables, filter, status, \
     total_sent, total_failed, started_at, completed_at, campaign_id, created_by, \
     created_at, updated_at";

/// 批量作业记录（bulk_jobs 表）
///
/// total_sent / total_failed 随分块执行增量累加，进入终态后冻结。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BulkJob {
    pub id: Uuid,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content: String,
    pub variables: sqlx::types::Json<HashMap<String, String>>,
    pub filter: sqlx::types::Json<RecipientFilter>,
    pub status: JobStatus,
    pub total_sent: i32,
    pub total_failed: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub campaign_id: Option<Uuid>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BulkJob {
    /// 转换为队列信封
    pub fn to_message(&self) -> JobMessage {
        JobMessage {
            id: self.id.to_string(),
            channel: self.channel,
            content: self.content.clone(),
            variables: self.variables.0.clone(),
            status: self.status,
        }
    }
}

/// 待插入的新作业
#[derive(Debug, Clone)]
pub struct NewBulkJob {
    pub id: Uuid,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content: String,
    pub variables: HashMap<String, String>,
    pub filter: RecipientFilter,
    pub campaign_id: Option<Uuid>,
    pub created_by: String,
}

/// 作业仓储抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkJobStore: Send + Sync {
    async fn insert(&self, job: NewBulkJob) -> Result<BulkJob>;

    async fn get(&self, id: Uuid) -> Result<Option<BulkJob>>;

    /// 受保护的状态转换，守卫未命中返回 None
    async fn transition(&self, id: Uuid, from: &[JobStatus], to: JobStatus)
    -> Result<Option<BulkJob>>;

    /// PENDING → PROCESSING 并记录 started_at；PROCESSING 作业可被重新认领
    async fn begin_processing(&self, id: Uuid) -> Result<Option<BulkJob>>;

    /// 增量累加计数器（仅对非终态作业生效，终态计数冻结）
    async fn add_counters(&self, id: Uuid, sent: i32, failed: i32) -> Result<()>;

    /// 未终态作业列表
    async fn list_active(&self) -> Result<Vec<BulkJob>>;

    /// 某活动名下的全部作业
    async fn list_by_campaign(&self, campaign_id: Uuid) -> Result<Vec<BulkJob>>;
}

/// PostgreSQL 实现
pub struct PgBulkJobStore {
    pool: PgPool,
}

impl PgBulkJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_value(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl BulkJobStore for PgBulkJobStore {
    async fn insert(&self, job: NewBulkJob) -> Result<BulkJob> {
        let sql = format!(
            "INSERT INTO bulk_jobs \
             (id, channel, subject, content, variables, filter, status, total_sent, \
              total_failed, campaign_id, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, 0, $7, $8) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, BulkJob>(&sql)
            .bind(job.id)
            .bind(job.channel)
            .bind(&job.subject)
            .bind(&job.content)
            .bind(sqlx::types::Json(&job.variables))
            .bind(sqlx::types::Json(&job.filter))
            .bind(job.campaign_id)
            .bind(&job.created_by)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BulkJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, BulkJob>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Option<BulkJob>> {
        let guard = from
            .iter()
            .map(|s| format!("'{}'", db_value(*s)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE bulk_jobs \
             SET status = $2, \
                 updated_at = NOW(), \
                 completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') \
                                     THEN NOW() ELSE completed_at END \
             WHERE id = $1 AND status IN ({guard}) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, BulkJob>(&sql)
            .bind(id)
            .bind(to)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn begin_processing(&self, id: Uuid) -> Result<Option<BulkJob>> {
        let sql = format!(
            "UPDATE bulk_jobs \
             SET status = 'processing', \
                 started_at = COALESCE(started_at, NOW()), \
                 updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'processing') \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, BulkJob>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn add_counters(&self, id: Uuid, sent: i32, failed: i32) -> Result<()> {
        // 终态守卫：取消/完成后的迟到上报不再改动计数
        sqlx::query(
            "UPDATE bulk_jobs \
             SET total_sent = total_sent + $2, \
                 total_failed = total_failed + $3, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<BulkJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM bulk_jobs \
             WHERE status IN ('pending', 'processing') \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, BulkJob>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_by_campaign(&self, campaign_id: Uuid) -> Result<Vec<BulkJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM bulk_jobs \
             WHERE campaign_id = $1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, BulkJob>(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
