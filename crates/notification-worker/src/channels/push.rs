//! 推送通道

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::Channel;

use super::{ChannelSender, OutgoingNotification};

/// 设备令牌的最小可信长度，短于此的视为损坏数据
const MIN_TOKEN_LEN: usize = 16;

/// 设备令牌仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    async fn tokens_for_user(&self, user_id: Uuid) -> Result<Vec<String>>;
}

/// PostgreSQL 实现（device_tokens 表）
pub struct PgDeviceTokenRepository {
    pool: PgPool,
}

impl PgDeviceTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceTokenRepository for PgDeviceTokenRepository {
    async fn tokens_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        let tokens: Vec<(String,)> =
            sqlx::query_as("SELECT token FROM device_tokens WHERE user_id = $1 AND revoked = FALSE")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(tokens.into_iter().map(|(t,)| t).collect())
    }
}

/// 推送传输层
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_push(&self, token: &str, title: &str, body: &str) -> Result<()>;
}

/// 日志模拟传输
pub struct SimulatedPushTransport;

#[async_trait]
impl PushTransport for SimulatedPushTransport {
    async fn send_push(&self, token: &str, title: &str, body: &str) -> Result<()> {
        info!(
            token_prefix = &token[..token.len().min(8)],
            title,
            body_len = body.len(),
            "模拟发送推送"
        );
        Ok(())
    }
}

pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    tokens: Arc<dyn DeviceTokenRepository>,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn PushTransport>, tokens: Arc<dyn DeviceTokenRepository>) -> Self {
        Self { transport, tokens }
    }
}

#[async_trait]
impl ChannelSender for PushChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn validate(&self, notification: &OutgoingNotification) -> Result<()> {
        if notification.content.trim().is_empty() {
            return Err(NotifyError::Validation("推送内容为空".to_string()));
        }
        Ok(())
    }

    /// 向用户的全部有效设备推送，任一设备成功即视为投递成功
    async fn deliver(&self, notification: &OutgoingNotification) -> Result<()> {
        let user_id = notification.recipient.id;
        let tokens = self.tokens.tokens_for_user(user_id).await?;

        let valid: Vec<&String> = tokens.iter().filter(|t| t.len() >= MIN_TOKEN_LEN).collect();
        if valid.len() < tokens.len() {
            warn!(
                user_id = %user_id,
                dropped = tokens.len() - valid.len(),
                "跳过形状非法的设备令牌"
            );
        }
        if valid.is_empty() {
            return Err(NotifyError::DeliveryFailed {
                channel: Channel::Push.to_string(),
                reason: "用户无有效设备令牌".to_string(),
            });
        }

        let title = notification.subject.as_deref().unwrap_or("通知");
        let mut delivered = 0usize;
        for token in &valid {
            match self
                .transport
                .send_push(token, title, &notification.content)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "单设备推送失败"),
            }
        }

        if delivered == 0 {
            return Err(NotifyError::DeliveryFailed {
                channel: Channel::Push.to_string(),
                reason: "所有设备推送均失败".to_string(),
            });
        }
        Ok(())
    }
}
