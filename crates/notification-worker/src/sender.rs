//! 单通道通知发送
//!
//! 发送流水线：限流 → 净化 → 校验 → 落库 → 传输投递 → 回填 sent_at。
//! 记录先于投递落库，sent_at 只在传输层确认成功后回填，
//! 因此 sent_at 为空的记录即"未确认送达"。传输失败在本层不重试。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use notify_shared::config::ChannelLimitsConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::Channel;

use crate::channels::{Attachment, ChannelSender, OutgoingNotification};
use crate::rate_limit::FixedWindowLimiter;
use crate::recipients::Recipient;
use crate::sanitize::sanitize_html;

// ---------------------------------------------------------------------------
// NotificationRecord
// ---------------------------------------------------------------------------

/// 通知优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// 已落库的通知记录（notifications 表）
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content: String,
    pub priority: Priority,
    pub metadata: Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// 待插入的通知记录
#[derive(Debug, Clone)]
pub struct NewNotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content: String,
    pub priority: Priority,
    pub metadata: Value,
}

/// 通知记录仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRecordStore: Send + Sync {
    async fn insert(&self, record: NewNotificationRecord) -> Result<()>;

    /// 传输确认成功后回填发送时间
    async fn mark_sent(&self, id: Uuid) -> Result<()>;

    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> Result<bool>;
}

/// PostgreSQL 实现
pub struct PgNotificationRecordStore {
    pool: PgPool,
}

impl PgNotificationRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRecordStore for PgNotificationRecordStore {
    async fn insert(&self, record: NewNotificationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications \
             (id, user_id, channel, subject, content, priority, metadata, read) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.channel)
        .bind(&record.subject)
        .bind(&record.content)
        .bind(record.priority)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_sent(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE notifications SET sent_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("UPDATE notifications SET read = TRUE WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// NotificationChannelSender
// ---------------------------------------------------------------------------

/// 单条发送请求（content 为渲染后的原始内容，净化在本层按通道处理）
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipient: Recipient,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub priority: Priority,
    pub metadata: Value,
}

/// 通道发送服务
pub struct NotificationChannelSender {
    channels: HashMap<Channel, Arc<dyn ChannelSender>>,
    store: Arc<dyn NotificationRecordStore>,
    limiter: FixedWindowLimiter,
    limits: ChannelLimitsConfig,
}

impl NotificationChannelSender {
    pub fn new(store: Arc<dyn NotificationRecordStore>, limits: ChannelLimitsConfig) -> Self {
        Self {
            channels: HashMap::new(),
            store,
            limiter: FixedWindowLimiter::new(Duration::from_secs(limits.rate_window_seconds)),
            limits,
        }
    }

    /// 注册通道实现
    pub fn with_channel(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.channels.insert(sender.channel(), sender);
        self
    }

    fn limit_for(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Email => self.limits.email_per_window,
            Channel::Sms => self.limits.sms_per_window,
            Channel::Push => self.limits.push_per_window,
        }
    }

    /// 发送一条通知，返回落库的记录 ID
    ///
    /// 限流与校验失败同步拒绝，记录不落库；传输失败返回
    /// DeliveryFailed，记录保留且 sent_at 为空。
    pub async fn send(&self, request: SendRequest) -> Result<Uuid> {
        let sender = self.channels.get(&request.channel).ok_or_else(|| {
            NotifyError::Internal(format!("通道未注册: {}", request.channel))
        })?;

        self.limiter
            .acquire(&request.channel.to_string(), self.limit_for(request.channel))?;

        // 只有承载 HTML 的邮件通道做净化；短信/推送是纯文本，
        // 实体转义反而会污染内容
        let content = match request.channel {
            Channel::Email => sanitize_html(&request.content),
            Channel::Sms | Channel::Push => request.content.clone(),
        };
        let notification = OutgoingNotification {
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            content,
            attachments: request.attachments,
        };

        sender.validate(&notification)?;

        let record_id = Uuid::now_v7();
        self.store
            .insert(NewNotificationRecord {
                id: record_id,
                user_id: request.recipient.id,
                channel: request.channel,
                subject: notification.subject.clone(),
                content: notification.content.clone(),
                priority: request.priority,
                metadata: request.metadata,
            })
            .await?;

        match sender.deliver(&notification).await {
            Ok(()) => {
                self.store.mark_sent(record_id).await?;
                info!(
                    record_id = %record_id,
                    user_id = %request.recipient.id,
                    channel = %request.channel,
                    "通知已送达"
                );
                Ok(record_id)
            }
            Err(e) => {
                warn!(
                    record_id = %record_id,
                    user_id = %request.recipient.id,
                    channel = %request.channel,
                    error = %e,
                    "通知投递失败"
                );
                Err(NotifyError::DeliveryFailed {
                    channel: request.channel.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
