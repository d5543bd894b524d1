//! 短信通道

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use notify_shared::config::ChannelLimitsConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::Channel;

use super::{ChannelSender, OutgoingNotification};

// E.164 风格：可选 +，首位非零，总长 8-15 位
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9]\d{7,14}$").unwrap_or_else(|_| unreachable!()));

/// 短信传输层
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send_sms(&self, to: &str, content: &str) -> Result<()>;
}

/// 日志模拟传输
pub struct SimulatedSmsTransport;

#[async_trait]
impl SmsTransport for SimulatedSmsTransport {
    async fn send_sms(&self, to: &str, content: &str) -> Result<()> {
        info!(to, content_len = content.chars().count(), "模拟发送短信");
        Ok(())
    }
}

pub struct SmsChannel {
    transport: Arc<dyn SmsTransport>,
    max_length: usize,
}

impl SmsChannel {
    pub fn new(transport: Arc<dyn SmsTransport>, limits: &ChannelLimitsConfig) -> Self {
        Self {
            transport,
            max_length: limits.max_sms_length,
        }
    }
}

#[async_trait]
impl ChannelSender for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn validate(&self, notification: &OutgoingNotification) -> Result<()> {
        let Some(phone) = &notification.recipient.phone else {
            return Err(NotifyError::Validation("收件人无手机号".to_string()));
        };
        if !PHONE_RE.is_match(phone) {
            return Err(NotifyError::Validation(format!("手机号格式非法: {phone}")));
        }

        // 超长拒绝而非截断，内容完整性优先
        let len = notification.content.chars().count();
        if len > self.max_length {
            return Err(NotifyError::Validation(format!(
                "短信内容 {len} 字超出上限 {}",
                self.max_length
            )));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &OutgoingNotification) -> Result<()> {
        let phone = notification
            .recipient
            .phone
            .as_deref()
            .ok_or_else(|| NotifyError::Validation("收件人无手机号".to_string()))?;
        self.transport.send_sms(phone, &notification.content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;
    use uuid::Uuid;

    fn notification(phone: Option<&str>, content: &str) -> OutgoingNotification {
        OutgoingNotification {
            recipient: Recipient {
                id: Uuid::now_v7(),
                name: Some("测试".to_string()),
                email: Some("user@example.com".to_string()),
                phone: phone.map(String::from),
            },
            subject: None,
            content: content.to_string(),
            attachments: vec![],
        }
    }

    fn channel() -> SmsChannel {
        SmsChannel::new(Arc::new(SimulatedSmsTransport), &ChannelLimitsConfig::default())
    }

    #[test]
    fn test_rejects_missing_phone() {
        let err = channel().validate(&notification(None, "hi")).unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[test]
    fn test_rejects_malformed_phone() {
        assert!(channel().validate(&notification(Some("12ab"), "hi")).is_err());
        assert!(channel().validate(&notification(Some("0123456789"), "hi")).is_err());
    }

    #[test]
    fn test_accepts_e164_phone() {
        assert!(channel().validate(&notification(Some("+8613800138000"), "hi")).is_ok());
        assert!(channel().validate(&notification(Some("13800138000"), "hi")).is_ok());
    }

    #[test]
    fn test_rejects_over_length_content() {
        let long = "好".repeat(501);
        let err = channel()
            .validate(&notification(Some("+8613800138000"), &long))
            .unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[test]
    fn test_length_counts_chars_not_bytes() {
        // 500 个多字节字符按字符数计，仍在上限内
        let content = "好".repeat(500);
        assert!(channel()
            .validate(&notification(Some("+8613800138000"), &content))
            .is_ok());
    }
}
