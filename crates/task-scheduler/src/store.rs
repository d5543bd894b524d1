//! 任务持久化仓储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use notify_shared::error::Result;
use notify_shared::messages::TaskStatus;

use crate::task::{NewTask, Task};

const TASK_COLUMNS: &str = "id, task_type, payload, scheduled_for, status, attempts, \
     max_attempts, last_attempt_at, completed_at, created_by, created_at, updated_at";

/// 任务仓储抽象，服务与 worker 依赖此 trait 以便脱离数据库测试
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: NewTask) -> Result<Task>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    /// 受保护的状态转换：仅当前状态在 `from` 集合内才更新
    ///
    /// 返回 None 表示守卫未命中（记录不存在或状态已变），
    /// 由调用方决定是视为非法转换还是幂等跳过。
    async fn transition(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Option<Task>>;

    /// 开始一次执行尝试：PENDING → PROCESSING，attempts 加一并记录时间。
    /// PROCESSING 任务同样可认领（中断残留的重新执行）。
    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Task>>;

    /// 查询已到期的 PENDING 任务，供补偿扫描重新投递
    async fn list_due_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>>;

    /// 查询滞留的 PROCESSING 任务：最近一次尝试早于 `cutoff` 仍未离开
    /// PROCESSING，视为执行方崩溃遗留，补偿扫描会重新投递
    async fn list_stale_processing(&self, cutoff: DateTime<Utc>, limit: i64)
    -> Result<Vec<Task>>;
}

/// PostgreSQL 实现
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 状态在数据库中的存储值（与 sqlx 的 lowercase 映射一致）
fn db_value(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Processing => "processing",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Task> {
        let sql = format!(
            "INSERT INTO scheduled_tasks \
             (id, task_type, payload, scheduled_for, status, attempts, max_attempts, created_by) \
             VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(task.id)
            .bind(task.task_type)
            .bind(&task.payload)
            .bind(task.scheduled_for)
            .bind(task.max_attempts)
            .bind(&task.created_by)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = $1");
        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Option<Task>> {
        // 守卫集合来自固定枚举映射，拼接是安全的
        let guard = from
            .iter()
            .map(|s| format!("'{}'", db_value(*s)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE scheduled_tasks \
             SET status = $2, \
                 updated_at = NOW(), \
                 completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') \
                                     THEN NOW() ELSE completed_at END \
             WHERE id = $1 AND status IN ({guard}) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(to)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Task>> {
        let sql = format!(
            "UPDATE scheduled_tasks \
             SET status = 'processing', \
                 attempts = attempts + 1, \
                 last_attempt_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'processing') \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_due_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
             WHERE status = 'pending' AND scheduled_for <= $1 \
             ORDER BY scheduled_for ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
             WHERE status = 'processing' AND last_attempt_at < $1 \
             ORDER BY last_attempt_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, Task>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
