//! 活动领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use notify_notification_worker::recipients::RecipientFilter;
use notify_shared::messages::Channel;

// ---------------------------------------------------------------------------
// CampaignType — 通道组合
// ---------------------------------------------------------------------------

/// 活动类型，决定投放通道组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum CampaignType {
    Email,
    Sms,
    Push,
    Mixed,
    Newsletter,
    Promo,
    Event,
}

impl CampaignType {
    /// 展开为具体投放通道
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            Self::Email | Self::Newsletter | Self::Promo => &[Channel::Email],
            Self::Sms => &[Channel::Sms],
            Self::Push => &[Channel::Push],
            Self::Mixed => &[Channel::Email, Channel::Sms, Channel::Push],
            Self::Event => &[Channel::Email, Channel::Push],
        }
    }
}

impl std::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::Mixed => "MIXED",
            Self::Newsletter => "NEWSLETTER",
            Self::Promo => "PROMO",
            Self::Event => "EVENT",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// CampaignStatus — 活动状态机
// ---------------------------------------------------------------------------

/// 活动状态
///
/// 状态机：DRAFT → SCHEDULED → ACTIVE ⇄ PAUSED；ACTIVE → COMPLETED；
/// 非终态均可 → CANCELLED。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Draft, Cancelled)
                | (Scheduled, Cancelled)
                | (Active, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "DRAFT",
            Self::Scheduled => "SCHEDULED",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// 活动记录（campaigns 表）
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    pub subject: Option<String>,
    pub content: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub target_filter: sqlx::types::Json<RecipientFilter>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待创建的新活动
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub campaign_type: CampaignType,
    pub subject: Option<String>,
    pub content: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub target_filter: RecipientFilter,
    pub created_by: String,
}

/// 活动投放指标，按名下作业聚合
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub job_count: usize,
    pub total_sent: i64,
    pub total_failed: i64,
    /// (sent - failed) / sent，sent 为 0 时取 0
    pub delivery_rate: f64,
}

impl CampaignStats {
    pub fn delivery_rate_of(total_sent: i64, total_failed: i64) -> f64 {
        if total_sent == 0 {
            0.0
        } else {
            (total_sent - total_failed) as f64 / total_sent as f64
        }
    }
}
