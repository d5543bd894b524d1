//! 任务领域模型

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use notify_shared::messages::{TaskMessage, TaskStatus, TaskType};

/// 持久化任务记录（scheduled_tasks 表）
///
/// 数据库是任务状态的唯一权威，队列消息只是投递信号；
/// 记录只做状态转换，从不删除。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 是否已到执行时间
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }

    /// 是否还有剩余重试额度
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// 转换为队列信封
    pub fn to_message(&self) -> TaskMessage {
        TaskMessage {
            id: self.id.to_string(),
            task_type: self.task_type,
            payload: self.payload.clone(),
            scheduled_for: self.scheduled_for,
            status: self.status,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
        }
    }
}

/// 调度选项
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// 显式指定任务 ID，用于调用方幂等重试
    pub id: Option<Uuid>,
    /// 覆盖默认最大尝试次数
    pub max_attempts: Option<u32>,
    pub created_by: Option<String>,
}

/// 待插入的新任务
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: Value,
    pub scheduled_for: DateTime<Utc>,
    pub max_attempts: i32,
    pub created_by: Option<String>,
}
