//! 通知通道
//!
//! 每个通道实现同一 trait：先校验再投递，校验不通过的内容
//! 不进入传输层。传输层本身也是 trait，当前提供日志模拟实现，
//! 接入真实网关时替换实现即可。

pub mod email;
pub mod push;
pub mod sms;

pub use email::{EmailChannel, EmailTransport, SimulatedEmailTransport};
pub use push::{DeviceTokenRepository, PushChannel, PushTransport, SimulatedPushTransport};
pub use sms::{SimulatedSmsTransport, SmsChannel, SmsTransport};

use async_trait::async_trait;

use notify_shared::error::Result;
use notify_shared::messages::Channel;

use crate::recipients::Recipient;

/// 附件
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// 待投递的单条通知（内容已渲染并净化）
#[derive(Debug, Clone)]
pub struct OutgoingNotification {
    pub recipient: Recipient,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl OutgoingNotification {
    /// 附件总大小
    pub fn attachments_size(&self) -> u64 {
        self.attachments.iter().map(|a| a.content.len() as u64).sum()
    }
}

/// 通道发送器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// 投递前校验，失败返回 Validation 错误
    fn validate(&self, notification: &OutgoingNotification) -> Result<()>;

    /// 调用传输层投递
    async fn deliver(&self, notification: &OutgoingNotification) -> Result<()>;
}
