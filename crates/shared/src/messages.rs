//! 消息模型与队列拓扑
//!
//! 定义任务与批量作业在消息代理上传递的统一信封格式、渠道与状态枚举，
//! 以及全部队列/交换机名称常量。信封只携带标识与少量冗余元数据，
//! 权威状态始终以持久化存储为准——消费端收到消息后必须回查存储
//! 并重新校验状态（墓碑检查），不能信任信封中的快照。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// 队列拓扑常量
// ---------------------------------------------------------------------------

/// 集中管理所有队列与交换机名称，防止字符串散落在各服务中导致拼写不一致
pub mod queues {
    /// 到期任务就绪队列，调度 worker 的唯一消费入口
    pub const TASKS_READY: &str = "notify.tasks.ready";
    /// 批量通知作业队列
    pub const JOBS: &str = "notify.jobs";
    /// 死信队列，投递无法解析或被丢弃的消息
    pub const DEAD_LETTER: &str = "notify.dlq";
    /// 延迟交换机（x-delayed-message 插件），承载未到期消息
    pub const DELAYED_EXCHANGE: &str = "notify.delayed";
    /// 延迟交换机到就绪队列的路由键
    pub const TASKS_ROUTING_KEY: &str = "tasks.ready";
}

// ---------------------------------------------------------------------------
// Channel — 通知投递渠道
// ---------------------------------------------------------------------------

/// 通知投递渠道
///
/// 各渠道有不同的格式校验与长度限制，发送层会按渠道适配内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// TaskType — 延迟任务类型
// ---------------------------------------------------------------------------

/// 延迟任务类型
///
/// 任务处理器按类型注册在枚举键的注册表中，由 worker 路由分发，
/// 不做任何基于字符串的条件分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum TaskType {
    /// 激活营销活动
    CampaignActivate,
    /// 结束营销活动
    CampaignComplete,
    /// 触发批量通知作业
    BulkDispatch,
    /// 调用方自定义任务
    Custom,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CampaignActivate => "CAMPAIGN_ACTIVATE",
            Self::CampaignComplete => "CAMPAIGN_COMPLETE",
            Self::BulkDispatch => "BULK_DISPATCH",
            Self::Custom => "CUSTOM",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// TaskStatus — 任务状态机
// ---------------------------------------------------------------------------

/// 延迟任务状态
///
/// 状态机：PENDING → PROCESSING → {COMPLETED, FAILED}；PENDING ⇄ PAUSED；
/// PENDING/PROCESSING → CANCELLED。终态后记录只读，不再流转也不删除。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态流转是否合法
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Paused, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                // 失败后重试：退回 PENDING 等待延迟重投，同时让补偿扫描兜底
                | (Processing, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// JobStatus — 批量作业状态机
// ---------------------------------------------------------------------------

/// 批量通知作业状态
///
/// 状态机：PENDING → PROCESSING → {COMPLETED, FAILED}；
/// PENDING/PROCESSING → CANCELLED。进入终态后计数器冻结。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态流转是否合法
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// TaskMessage / JobMessage — 消息信封
// ---------------------------------------------------------------------------

/// 延迟任务消息信封
///
/// 随队列/延迟交换机传递。status/attempts 等字段是发布时刻的快照，
/// 仅用于日志排查，消费端以存储中的权威记录为准。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: String,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// 批量通知作业消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub id: String,
    pub channel: Channel,
    pub content: String,
    /// 调用方模板变量，渲染时覆盖系统默认变量
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装无法解析或被处理器丢弃的原始消息，附加失败原因与来源元数据，
/// 供人工排查。死信队列本身没有自动消费者。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID（如 task_id / job_id，解析失败时为空串）
    pub message_id: String,
    /// 原始队列
    pub source_queue: String,
    /// 原始消息内容（UTF-8 损坏时为 base64 无关的十六进制摘要）
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 失败时间
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn new(
        message_id: impl Into<String>,
        source_queue: impl Into<String>,
        payload: impl Into<String>,
        error: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_queue: source_queue.into(),
            payload: payload.into(),
            error: error.into(),
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
