//! 活动仓储

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use notify_shared::error::Result;

use crate::campaign::{Campaign, CampaignStatus, NewCampaign};

const CAMPAIGN_COLUMNS: &str = "id, campaign_type, status, subject, content, start_date, \
     end_date, target_filter, created_by, created_at, updated_at";

/// 活动仓储抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert(&self, campaign: NewCampaign) -> Result<Campaign>;

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>>;

    /// 受保护的状态转换，守卫未命中返回 None
    async fn transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>>;
}

/// PostgreSQL 实现
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_value(status: CampaignStatus) -> &'static str {
    match status {
        CampaignStatus::Draft => "draft",
        CampaignStatus::Scheduled => "scheduled",
        CampaignStatus::Active => "active",
        CampaignStatus::Paused => "paused",
        CampaignStatus::Cancelled => "cancelled",
        CampaignStatus::Completed => "completed",
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn insert(&self, campaign: NewCampaign) -> Result<Campaign> {
        let sql = format!(
            "INSERT INTO campaigns \
             (id, campaign_type, status, subject, content, start_date, end_date, \
              target_filter, created_by) \
             VALUES ($1, $2, 'draft', $3, $4, $5, $6, $7, $8) \
             RETURNING {CAMPAIGN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Campaign>(&sql)
            .bind(Uuid::now_v7())
            .bind(campaign.campaign_type)
            .bind(&campaign.subject)
            .bind(&campaign.content)
            .bind(campaign.start_date)
            .bind(campaign.end_date)
            .bind(sqlx::types::Json(&campaign.target_filter))
            .bind(&campaign.created_by)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        let guard = from
            .iter()
            .map(|s| format!("'{}'", db_value(*s)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE campaigns \
             SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status IN ({guard}) \
             RETURNING {CAMPAIGN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .bind(to)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}
