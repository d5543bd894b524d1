//! 邮件通道

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use validator::ValidateEmail;

use notify_shared::config::ChannelLimitsConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::Channel;

use super::{ChannelSender, OutgoingNotification};

/// 邮件传输层
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

/// 日志模拟传输，生产接入 SMTP 网关时替换
pub struct SimulatedEmailTransport;

#[async_trait]
impl EmailTransport for SimulatedEmailTransport {
    async fn send_email(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        info!(
            to,
            subject,
            body_len = html_body.len(),
            "模拟发送邮件"
        );
        Ok(())
    }
}

pub struct EmailChannel {
    transport: Arc<dyn EmailTransport>,
    max_attachment_bytes: u64,
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn EmailTransport>, limits: &ChannelLimitsConfig) -> Self {
        Self {
            transport,
            max_attachment_bytes: limits.max_attachment_bytes,
        }
    }
}

#[async_trait]
impl ChannelSender for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate(&self, notification: &OutgoingNotification) -> Result<()> {
        let Some(email) = notification.recipient.email.as_deref() else {
            return Err(NotifyError::Validation("收件人缺少邮箱地址".to_string()));
        };
        if !email.validate_email() {
            return Err(NotifyError::Validation(format!("邮箱地址非法: {email}")));
        }

        let size = notification.attachments_size();
        if size > self.max_attachment_bytes {
            return Err(NotifyError::Validation(format!(
                "附件总大小 {size} 超出上限 {}",
                self.max_attachment_bytes
            )));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &OutgoingNotification) -> Result<()> {
        let Some(email) = notification.recipient.email.as_deref() else {
            return Err(NotifyError::Validation("收件人缺少邮箱地址".to_string()));
        };
        let subject = notification.subject.as_deref().unwrap_or("(无主题)");
        self.transport
            .send_email(email, subject, &notification.content)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;
    use crate::channels::Attachment;
    use uuid::Uuid;

    fn notification(email: &str) -> OutgoingNotification {
        OutgoingNotification {
            recipient: Recipient {
                id: Uuid::now_v7(),
                name: Some("测试".to_string()),
                email: Some(email.to_string()),
                phone: None,
            },
            subject: Some("欢迎".to_string()),
            content: "<p>你好</p>".to_string(),
            attachments: vec![],
        }
    }

    fn channel() -> EmailChannel {
        EmailChannel::new(
            Arc::new(SimulatedEmailTransport),
            &ChannelLimitsConfig::default(),
        )
    }

    #[test]
    fn test_rejects_malformed_address() {
        let err = channel().validate(&notification("not-an-email")).unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[test]
    fn test_rejects_missing_address() {
        let mut n = notification("user@example.com");
        n.recipient.email = None;
        let err = channel().validate(&n).unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[test]
    fn test_accepts_valid_address() {
        assert!(channel().validate(&notification("user@example.com")).is_ok());
    }

    #[test]
    fn test_rejects_oversized_attachments() {
        let mut n = notification("user@example.com");
        n.attachments.push(Attachment {
            filename: "big.pdf".to_string(),
            content: vec![0u8; 11 * 1024 * 1024],
        });
        let err = channel().validate(&n).unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_deliver_uses_transport() {
        let mut transport = MockEmailTransport::new();
        transport
            .expect_send_email()
            .withf(|to, subject, _| to == "user@example.com" && subject == "欢迎")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let channel = EmailChannel::new(Arc::new(transport), &ChannelLimitsConfig::default());
        channel.deliver(&notification("user@example.com")).await.unwrap();
    }
}
